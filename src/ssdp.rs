//! Device discovery via SSDP multicast.
//!
//! This module knows nothing about bridges: it sends one `M-SEARCH` query and
//! hands back whatever answers arrive within the search window.

use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use log::{debug, trace};

use crate::errors::Error;
use crate::runtime::{self, AsyncUdpSocket, BoxFuture, Instant, UdpSocket};

type Result<T> = std::result::Result<T, Error>;

pub const SSDP_ADDR: &str = "239.255.255.250";
pub const SSDP_PORT: u16 = 1900;
/// Searches should not leave the local network.
pub const SSDP_TTL: u32 = 2;

/// One answer to an SSDP search.
#[derive(Debug, Clone)]
pub struct SsdpResponse {
    ip: IpAddr,
    headers: Vec<(String, String)>,
}

impl SsdpResponse {
    /// Parse the HTTP-style text of an SSDP answer.
    ///
    /// Returns `None` unless both `LOCATION` and `USN` are present.
    pub fn parse(ip: IpAddr, text: &str) -> Option<Self> {
        let headers: Vec<(String, String)> = text
            .lines()
            .skip(1)
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_ascii_uppercase(), value.trim().to_string()))
            })
            .collect();

        let response = SsdpResponse { ip, headers };
        if response.location().is_some() && response.usn().is_some() {
            Some(response)
        } else {
            None
        }
    }

    /// Address the answer came from.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("LOCATION")
    }

    pub fn usn(&self) -> Option<&str> {
        self.header("USN")
    }

    /// Hardware serial embedded in the USN.
    ///
    /// This is the last run of twelve hex digits, lower-cased.
    pub fn serial(&self) -> Option<String> {
        self.usn().and_then(extract_serial)
    }
}

/// Build the `M-SEARCH` datagram for `service_type`.
pub fn search_message(service_type: &str, window: Duration) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_ADDR}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {service_type}\r\n\
         \r\n",
        window.as_secs().max(1)
    )
}

/// Send one SSDP search and report each responding address once.
///
/// `on_response` is called for the first valid answer from every address
/// heard within `window`. Returning is the end-of-batch signal; the number of
/// delivered responses is returned. Bind and send failures are reported
/// immediately, answers already delivered stay valid.
///
/// # Examples
///
/// ```ignore
/// use std::time::Duration;
/// use hue_bridge_rs::ssdp;
///
/// ssdp::discover("upnp:rootdevice", Duration::from_secs(3), |response| {
///     println!("{} -> {:?}", response.ip(), response.location());
/// })
/// .await?;
/// ```
pub async fn discover<F>(service_type: &str, window: Duration, mut on_response: F) -> Result<usize>
where
    F: FnMut(SsdpResponse) + Send,
{
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::socket("bind", e))?;
    socket
        .set_multicast_ttl_v4(SSDP_TTL)
        .map_err(|e| Error::socket("set_multicast_ttl_v4", e))?;

    let msg = search_message(service_type, window);
    socket
        .send_to(msg.as_bytes(), &format!("{SSDP_ADDR}:{SSDP_PORT}"))
        .await
        .map_err(|e| Error::socket("send_to", e))?;
    debug!("Sent SSDP search for {service_type}");

    let mut seen: HashSet<IpAddr> = HashSet::new();
    let start = Instant::now();
    let mut buffer = [0u8; 4096];

    loop {
        let Some(remaining) = window.checked_sub(start.elapsed()) else {
            break;
        };

        match runtime::timeout(remaining, socket.recv_from(&mut buffer)).await {
            Ok(Ok((size, addr))) => {
                let Ok(text) = std::str::from_utf8(&buffer[..size]) else {
                    trace!("Ignoring non-UTF-8 SSDP datagram from {addr}");
                    continue;
                };
                let Some(response) = SsdpResponse::parse(addr.ip(), text) else {
                    trace!("Ignoring SSDP datagram without LOCATION/USN from {addr}");
                    continue;
                };
                if seen.insert(addr.ip()) {
                    on_response(response);
                }
            }
            Ok(Err(e)) => debug!("SSDP receive error: {e}"),
            Err(_) => break,
        }
    }

    debug!("SSDP search for {service_type} done, {} responder(s)", seen.len());
    Ok(seen.len())
}

/// A source of SSDP answers.
///
/// [`SsdpDiscoverer`] does real multicast; the registry accepts any
/// implementation, which is how it is exercised without a network.
pub trait Discoverer: Send + Sync {
    fn discover<'a>(
        &'a self,
        service_type: &'a str,
        window: Duration,
        on_response: Box<dyn FnMut(SsdpResponse) + Send + 'a>,
    ) -> BoxFuture<'a, Result<usize>>;
}

/// [`Discoverer`] backed by [`discover`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SsdpDiscoverer;

impl Discoverer for SsdpDiscoverer {
    fn discover<'a>(
        &'a self,
        service_type: &'a str,
        window: Duration,
        on_response: Box<dyn FnMut(SsdpResponse) + Send + 'a>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(discover(service_type, window, on_response))
    }
}

fn extract_serial(usn: &str) -> Option<String> {
    let bytes = usn.as_bytes();
    let mut run_end = None;
    let mut run_len = 0;

    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_hexdigit() {
            run_len += 1;
            if run_len >= 12 {
                run_end = Some(i + 1);
            }
        } else {
            run_len = 0;
        }
    }

    run_end.map(|end| usn[end - 12..end].to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const HUE_RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age=100\r\n\
        EXT:\r\n\
        LOCATION: http://192.168.1.20:80/description.xml\r\n\
        SERVER: FreeRTOS/6.0.5, UPnP/1.0, IpBridge/0.1\r\n\
        ST: upnp:rootdevice\r\n\
        USN: uuid:2f402f80-da50-11e1-9b23-00178810AB2C::upnp:rootdevice\r\n\
        \r\n";

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn test_parse_response() {
        let response = SsdpResponse::parse(ip(), HUE_RESPONSE).unwrap();
        assert_eq!(response.ip(), ip());
        assert_eq!(response.location(), Some("http://192.168.1.20:80/description.xml"));
        assert_eq!(response.header("server"), Some("FreeRTOS/6.0.5, UPnP/1.0, IpBridge/0.1"));
        assert_eq!(response.header("EXT"), Some(""));
    }

    #[test]
    fn test_serial_from_usn() {
        let response = SsdpResponse::parse(ip(), HUE_RESPONSE).unwrap();
        assert_eq!(response.serial().as_deref(), Some("00178810ab2c"));
    }

    #[test]
    fn test_serial_takes_last_twelve_digits_of_long_run() {
        assert_eq!(extract_serial("uuid:0123456789abcdef").as_deref(), Some("456789abcdef"));
        assert_eq!(extract_serial("uuid:short-id"), None);
    }

    #[test]
    fn test_parse_requires_location_and_usn() {
        let text = "HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\nUSN: uuid:x\r\n\r\n";
        assert!(SsdpResponse::parse(ip(), text).is_none());
        assert!(SsdpResponse::parse(ip(), "").is_none());
    }

    #[test]
    fn test_search_message() {
        let msg = search_message("upnp:rootdevice", Duration::from_secs(3));
        assert!(msg.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(msg.contains("HOST: 239.255.255.250:1900\r\n"));
        assert!(msg.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(msg.contains("MX: 3\r\n"));
        assert!(msg.contains("ST: upnp:rootdevice\r\n"));
        assert!(msg.ends_with("\r\n\r\n"));
    }
}
