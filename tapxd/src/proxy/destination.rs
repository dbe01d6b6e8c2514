use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpStream;

/// Failure modes of the original-destination lookup. `NotFound` means the
/// source tuple has no mapping; `Transient` means the lookup itself failed
/// and may succeed on a later connection.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no original destination for {0}")]
    NotFound(SocketAddr),
    #[error("destination lookup failed")]
    Transient(#[source] std::io::Error),
}

/// Recovers the pre-redirect (IP, port) a client was actually dialing.
///
/// `Kernel` asks the NAT table through SO_ORIGINAL_DST and is the production
/// path behind iptables REDIRECT. `Static` maps source tuples explicitly and
/// serves tests and platforms without the sockopt.
#[derive(Clone, Debug)]
pub enum DestinationResolver {
    Kernel,
    Static {
        targets: HashMap<SocketAddr, SocketAddr>,
        fallback: Option<SocketAddr>,
    },
}

impl DestinationResolver {
    pub fn from_config(config: &tapx_core::config::DestinationConfig) -> Result<Self> {
        match config.mode.as_str() {
            "static" => {
                let mut targets = HashMap::new();
                for entry in &config.static_targets {
                    targets.insert(entry.source.parse()?, entry.target.parse()?);
                }
                let fallback = config
                    .fallback
                    .as_deref()
                    .map(str::parse)
                    .transpose()?;
                Ok(Self::Static { targets, fallback })
            }
            _ => Ok(Self::Kernel),
        }
    }

    pub fn resolve(
        &self,
        stream: &TcpStream,
        source: SocketAddr,
    ) -> Result<SocketAddr, ResolveError> {
        match self {
            Self::Kernel => original_dst(stream),
            Self::Static { targets, fallback } => targets
                .get(&source)
                .copied()
                .or(*fallback)
                .ok_or(ResolveError::NotFound(source)),
        }
    }
}

#[cfg(target_os = "linux")]
fn original_dst(stream: &TcpStream) -> Result<SocketAddr, ResolveError> {
    use std::mem::MaybeUninit;
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: i32 = 80;

    let fd = stream.as_raw_fd();
    let mut addr: MaybeUninit<libc::sockaddr_in> = MaybeUninit::uninit();
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            addr.as_mut_ptr() as *mut _,
            &mut len as *mut _,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            // No NAT entry for this socket: traffic reached us directly.
            Some(libc::ENOENT) | Some(libc::ENOPROTOOPT) => Err(ResolveError::NotFound(
                stream.peer_addr().unwrap_or_else(|_| unspecified()),
            )),
            _ => Err(ResolveError::Transient(err)),
        };
    }
    if len < std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t {
        return Err(ResolveError::Transient(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "short sockaddr_in from SO_ORIGINAL_DST",
        )));
    }
    let addr = unsafe { addr.assume_init() };
    let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::new(std::net::IpAddr::V4(ip), port))
}

#[cfg(not(target_os = "linux"))]
fn original_dst(stream: &TcpStream) -> Result<SocketAddr, ResolveError> {
    Err(ResolveError::NotFound(
        stream.peer_addr().unwrap_or_else(|_| unspecified()),
    ))
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapx_core::config::{DestinationConfig, StaticTargetConfig};

    fn static_config(fallback: Option<&str>) -> DestinationConfig {
        DestinationConfig {
            mode: "static".to_string(),
            static_targets: vec![StaticTargetConfig {
                source: "127.0.0.1:40000".to_string(),
                target: "127.0.0.1:5432".to_string(),
            }],
            fallback: fallback.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn static_resolver_maps_and_falls_back() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;

        let resolver = DestinationResolver::from_config(&static_config(Some("127.0.0.1:9000")))?;
        let mapped = resolver
            .resolve(&client, "127.0.0.1:40000".parse()?)
            .expect("mapped");
        assert_eq!(mapped, "127.0.0.1:5432".parse()?);

        let fallback = resolver
            .resolve(&client, "127.0.0.1:40001".parse()?)
            .expect("fallback");
        assert_eq!(fallback, "127.0.0.1:9000".parse()?);
        Ok(())
    }

    #[tokio::test]
    async fn static_resolver_without_mapping_is_not_found() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;

        let resolver = DestinationResolver::from_config(&static_config(None))?;
        let err = resolver
            .resolve(&client, "127.0.0.1:40001".parse()?)
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
        Ok(())
    }
}
