//! Parsing of user given endpoints into socket addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::io;


/// Default port of servers.
pub const DEFAULT_PORT: u16 = 25565;


/// Parse an endpoint and resolve it to a socket address, the host name to announce in
/// the handshake is also returned. Accepted forms are `host:port`, a bare IP address 
/// (default port), a bare port (loopback) or a bare host name (default port).
pub fn parse_endpoint(endpoint: &str) -> io::Result<(SocketAddr, String)> {

    let endpoint = endpoint.trim();

    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok((addr, addr.ip().to_string()));
    }

    if let Ok(ip) = endpoint.parse::<IpAddr>() {
        return Ok((SocketAddr::new(ip, DEFAULT_PORT), ip.to_string()));
    }

    if let Ok(port) = endpoint.parse::<u16>() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        return Ok((SocketAddr::new(ip, port), ip.to_string()));
    }

    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in endpoint: {endpoint}")))?;
            (host, port)
        }
        None => (endpoint, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host in endpoint"));
    }

    let addr = (host, port).to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for host: {host}")))?;

    Ok((addr, host.to_string()))

}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn forms() {

        let (addr, host) = parse_endpoint("10.0.0.2:1234").unwrap();
        assert_eq!(addr, "10.0.0.2:1234".parse().unwrap());
        assert_eq!(host, "10.0.0.2");

        let (addr, _) = parse_endpoint("10.0.0.2").unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);

        let (addr, host) = parse_endpoint("4000").unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
        assert_eq!(host, "127.0.0.1");

        let (addr, host) = parse_endpoint("localhost:4001").unwrap();
        assert_eq!(addr.port(), 4001);
        assert!(addr.ip().is_loopback());
        assert_eq!(host, "localhost");

        assert!(parse_endpoint("localhost:notaport").is_err());
        assert!(parse_endpoint(":25565").is_err());

    }

}
