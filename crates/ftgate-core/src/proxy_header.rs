use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHeaderError {
    #[error("client and origin endpoints use different address families")]
    AddressFamilyMismatch,
}

pub fn proxy_header_v1(
    client: SocketAddr,
    origin: SocketAddr,
) -> Result<String, ProxyHeaderError> {
    let transport = match (client, origin) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
        (SocketAddr::V6(_), SocketAddr::V6(_)) => "TCP6",
        _ => return Err(ProxyHeaderError::AddressFamilyMismatch),
    };
    Ok(format!(
        "PROXY {transport} {} {} {} {}\r\n",
        client.ip(),
        origin.ip(),
        client.port(),
        origin.port()
    ))
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{proxy_header_v1, ProxyHeaderError};

    #[test]
    fn formats_tcp4_header() {
        let client: SocketAddr = "192.0.2.10:54321".parse().expect("client");
        let origin: SocketAddr = "10.0.0.2:21".parse().expect("origin");
        assert_eq!(
            proxy_header_v1(client, origin).expect("header"),
            "PROXY TCP4 192.0.2.10 10.0.0.2 54321 21\r\n"
        );
    }

    #[test]
    fn formats_tcp6_header() {
        let client: SocketAddr = "[2001:db8::10]:54321".parse().expect("client");
        let origin: SocketAddr = "[2001:db8::2]:21".parse().expect("origin");
        assert_eq!(
            proxy_header_v1(client, origin).expect("header"),
            "PROXY TCP6 2001:db8::10 2001:db8::2 54321 21\r\n"
        );
    }

    #[test]
    fn rejects_mixed_address_families() {
        let client: SocketAddr = "192.0.2.10:54321".parse().expect("client");
        let origin: SocketAddr = "[2001:db8::2]:21".parse().expect("origin");
        assert_eq!(
            proxy_header_v1(client, origin).expect_err("mixed families"),
            ProxyHeaderError::AddressFamilyMismatch
        );
    }
}
