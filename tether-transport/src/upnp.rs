//! Asynchronous IGD discovery and port-mapping lifecycle.
//!
//! SSDP M-SEARCH finds the gateway, its device description names the
//! WANIPConnection control URL, and SOAP calls manage the mappings. A
//! maintenance task re-asserts mappings every five minutes; on shutdown
//! every mapping this session created is removed.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};
use tracing::{debug, info, warn};

const SSDP_MULTICAST: &str = "239.255.255.250:1900";
const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
const WAN_IP_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
const WAN_PPP_SERVICE: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

/// Lease requested for each mapping. Kept short so a crashed client's
/// mappings expire on their own.
const LEASE_SECS: u32 = 1800;

/// How often the maintenance task re-verifies the mappings.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpnpError {
    #[error("no gateway answered the ssdp search")]
    NoGateway,
    #[error("gateway description lacks a WAN connection service")]
    NoWanService,
    #[error("bad url: {0}")]
    BadUrl(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("soap fault from gateway")]
    SoapFault,
    #[error("xml: {0}")]
    Xml(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
}

pub type UpnpResult<T> = Result<T, UpnpError>;

/// Mapping protocol, stringly typed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// A discovered internet gateway device.
#[derive(Debug, Clone)]
pub struct Gateway {
    control_url: ParsedUrl,
    service_type: String,
}

#[derive(Debug, Clone)]
struct ParsedUrl {
    host: String,
    port: u16,
    path: String,
}

impl ParsedUrl {
    fn parse(url: &str) -> UpnpResult<Self> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| UpnpError::BadUrl(url.to_string()))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|_| UpnpError::BadUrl(url.to_string()))?,
            ),
            None => (authority.to_string(), 80),
        };
        Ok(Self {
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Resolve a possibly relative URL against this one's authority.
    fn join(&self, target: &str) -> UpnpResult<ParsedUrl> {
        if target.starts_with("http://") {
            ParsedUrl::parse(target)
        } else {
            let path = if target.starts_with('/') {
                target.to_string()
            } else {
                format!("/{target}")
            };
            Ok(ParsedUrl {
                host: self.host.clone(),
                port: self.port,
                path,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Minimal HTTP over TcpStream (control-point traffic only)
// ---------------------------------------------------------------------------

async fn http_exchange(url: &ParsedUrl, request: String) -> UpnpResult<(u16, String)> {
    let exchange = async {
        let mut stream = TcpStream::connect((url.host.as_str(), url.port)).await?;
        stream.write_all(request.as_bytes()).await?;
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;
        Ok::<_, std::io::Error>(raw)
    };
    let raw = tokio::time::timeout(HTTP_TIMEOUT, exchange)
        .await
        .map_err(|_| UpnpError::Timeout)??;
    let text = String::from_utf8_lossy(&raw);
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let body = match text.find("\r\n\r\n") {
        Some(idx) => text[idx + 4..].to_string(),
        None => String::new(),
    };
    Ok((status, body))
}

async fn http_get(url: &ParsedUrl) -> UpnpResult<String> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}:{}\r\nConnection: close\r\n\r\n",
        url.path, url.host, url.port
    );
    let (status, body) = http_exchange(url, request).await?;
    if status != 200 {
        return Err(UpnpError::HttpStatus(status));
    }
    Ok(body)
}

async fn soap_call(
    url: &ParsedUrl,
    service_type: &str,
    action: &str,
    arguments: &str,
) -> UpnpResult<String> {
    let envelope = format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action} xmlns:u="{service_type}">{arguments}</u:{action}></s:Body>
</s:Envelope>"#
    );
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}:{}\r\nContent-Type: text/xml; charset=\"utf-8\"\r\n\
         SOAPAction: \"{}#{}\"\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        url.path,
        url.host,
        url.port,
        service_type,
        action,
        envelope.len(),
        envelope
    );
    let (status, body) = http_exchange(url, request).await?;
    if status == 500 || body.contains("UPnPError") {
        return Err(UpnpError::SoapFault);
    }
    if status != 200 {
        return Err(UpnpError::HttpStatus(status));
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Search for an IGD and resolve its WAN connection control URL.
pub async fn discover() -> UpnpResult<Gateway> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let search = format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {SSDP_MULTICAST}\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\nST: {SEARCH_TARGET}\r\n\r\n"
    );
    let target: SocketAddr = SSDP_MULTICAST
        .parse()
        .map_err(|_| UpnpError::BadUrl(SSDP_MULTICAST.into()))?;
    socket.send_to(search.as_bytes(), target).await?;

    let mut buf = vec![0u8; 2048];
    let deadline = tokio::time::Instant::now() + DISCOVER_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(UpnpError::NoGateway);
        }
        let (len, from) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(UpnpError::NoGateway),
        };
        let response = String::from_utf8_lossy(&buf[..len]);
        let Some(location) = response
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("location")
                    .then(|| value.trim().to_string())
            })
        else {
            continue;
        };
        debug!("ssdp answer from {from}: {location}");
        let description_url = ParsedUrl::parse(&location)?;
        let description = http_get(&description_url).await?;
        match parse_wan_service(&description, &description_url) {
            Ok(gateway) => return Ok(gateway),
            Err(e) => {
                debug!("gateway at {from} unusable: {e}");
                continue;
            }
        }
    }
}

/// Pull the WANIPConnection (or WANPPPConnection) control URL out of a
/// device description document.
fn parse_wan_service(description: &str, base: &ParsedUrl) -> UpnpResult<Gateway> {
    let mut reader = Reader::from_str(description);
    reader.trim_text(true);

    let mut current_element = String::new();
    let mut service_type = String::new();
    let mut control_url = String::new();
    let mut found: Option<(String, String)> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                current_element = String::from_utf8_lossy(e.name().as_ref()).to_string();
            }
            Ok(XmlEvent::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| UpnpError::Xml(e.to_string()))?
                    .to_string();
                match current_element.as_str() {
                    "serviceType" => service_type = text,
                    "controlURL" => control_url = text,
                    _ => {}
                }
            }
            Ok(XmlEvent::End(e)) => {
                if e.name().as_ref() == b"service" {
                    if (service_type == WAN_IP_SERVICE || service_type == WAN_PPP_SERVICE)
                        && !control_url.is_empty()
                    {
                        // Prefer WANIPConnection when both exist.
                        let better = found.is_none() || service_type == WAN_IP_SERVICE;
                        if better {
                            found = Some((service_type.clone(), control_url.clone()));
                        }
                    }
                    service_type.clear();
                    control_url.clear();
                }
                current_element.clear();
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(UpnpError::Xml(e.to_string())),
            _ => {}
        }
    }

    let (service_type, control_url) = found.ok_or(UpnpError::NoWanService)?;
    Ok(Gateway {
        control_url: base.join(&control_url)?,
        service_type,
    })
}

/// Extract the text content of the first occurrence of `element`.
fn xml_text_of(body: &str, element: &str) -> Option<String> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                inside = e.name().as_ref() == element.as_bytes();
            }
            Ok(XmlEvent::Text(t)) if inside => {
                return t.unescape().ok().map(|s| s.to_string());
            }
            Ok(XmlEvent::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

impl Gateway {
    pub async fn external_ip(&self) -> UpnpResult<IpAddr> {
        let body = soap_call(
            &self.control_url,
            &self.service_type,
            "GetExternalIPAddress",
            "",
        )
        .await?;
        let text = xml_text_of(&body, "NewExternalIPAddress")
            .ok_or_else(|| UpnpError::Xml("missing NewExternalIPAddress".into()))?;
        text.parse::<IpAddr>()
            .map_err(|_| UpnpError::Xml(format!("bad external ip {text:?}")))
    }

    pub async fn add_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
        internal: SocketAddr,
        description: &str,
    ) -> UpnpResult<()> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>\
             <NewInternalPort>{}</NewInternalPort>\
             <NewInternalClient>{}</NewInternalClient>\
             <NewEnabled>1</NewEnabled>\
             <NewPortMappingDescription>{description}</NewPortMappingDescription>\
             <NewLeaseDuration>{LEASE_SECS}</NewLeaseDuration>",
            protocol.as_str(),
            internal.port(),
            internal.ip(),
        );
        soap_call(
            &self.control_url,
            &self.service_type,
            "AddPortMapping",
            &arguments,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> UpnpResult<()> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>",
            protocol.as_str(),
        );
        soap_call(
            &self.control_url,
            &self.service_type,
            "DeletePortMapping",
            &arguments,
        )
        .await?;
        Ok(())
    }

    /// Whether the gateway still holds our mapping.
    pub async fn verify_port_mapping(
        &self,
        protocol: Protocol,
        external_port: u16,
    ) -> UpnpResult<bool> {
        let arguments = format!(
            "<NewRemoteHost></NewRemoteHost>\
             <NewExternalPort>{external_port}</NewExternalPort>\
             <NewProtocol>{}</NewProtocol>",
            protocol.as_str(),
        );
        match soap_call(
            &self.control_url,
            &self.service_type,
            "GetSpecificPortMappingEntry",
            &arguments,
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(UpnpError::SoapFault) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Port mappings held for the lifetime of one session, with background
/// maintenance.
pub struct UpnpSession {
    gateway: Gateway,
    internal: SocketAddr,
    external_port: u16,
    external_ip: Mutex<Option<IpAddr>>,
    shutdown: tokio::sync::Notify,
}

impl UpnpSession {
    /// Discover the gateway and map `external_port` to `internal` for both
    /// TCP and UDP. Spawns the maintenance task.
    pub async fn establish(internal: SocketAddr, external_port: u16) -> UpnpResult<Arc<Self>> {
        let gateway = discover().await?;
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            gateway
                .add_port_mapping(protocol, external_port, internal, "Tether file exchange")
                .await?;
        }
        let external_ip = gateway.external_ip().await.ok();
        if let Some(ip) = external_ip {
            info!("igd mapped {external_port} -> {internal} (external ip {ip})");
        }
        let session = Arc::new(Self {
            gateway,
            internal,
            external_port,
            external_ip: Mutex::new(external_ip),
            shutdown: tokio::sync::Notify::new(),
        });
        session.clone().spawn_maintenance();
        Ok(session)
    }

    /// External endpoint implied by the mapping, when the gateway reported
    /// its external address.
    pub fn external_endpoint(&self) -> Option<SocketAddr> {
        self.external_ip
            .lock()
            .as_ref()
            .map(|ip| SocketAddr::new(*ip, self.external_port))
    }

    fn spawn_maintenance(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                    _ = self.shutdown.notified() => return,
                }
                for protocol in [Protocol::Tcp, Protocol::Udp] {
                    let alive = self
                        .gateway
                        .verify_port_mapping(protocol, self.external_port)
                        .await
                        .unwrap_or(false);
                    if !alive {
                        warn!(
                            "igd dropped the {} mapping for {}, re-adding",
                            protocol.as_str(),
                            self.external_port
                        );
                        if let Err(e) = self
                            .gateway
                            .add_port_mapping(
                                protocol,
                                self.external_port,
                                self.internal,
                                "Tether file exchange",
                            )
                            .await
                        {
                            warn!("re-adding {} mapping failed: {e}", protocol.as_str());
                        }
                    }
                }
                if let Ok(ip) = self.gateway.external_ip().await {
                    *self.external_ip.lock() = Some(ip);
                }
            }
        });
    }

    /// Remove every mapping this session created.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            if let Err(e) = self
                .gateway
                .delete_port_mapping(protocol, self.external_port)
                .await
            {
                debug!("removing {} mapping failed: {e}", protocol.as_str());
            }
        }
    }
}
