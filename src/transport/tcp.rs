//! TCP connection setup.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};

use crate::error::{Result, RpcError};

/// Split a comma-separated `host:port` list, trimming blanks.
pub fn parse_address_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolve a logical `host:port` address to its socket addresses.
pub async fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = lookup_host(addr)
        .await
        .map_err(|e| RpcError::CommunicationFailure(format!("cannot resolve '{addr}': {e}")))?
        .collect();
    if resolved.is_empty() {
        return Err(RpcError::CommunicationFailure(format!(
            "'{addr}' resolved to no addresses"
        )));
    }
    Ok(resolved)
}

/// Connect to the first reachable socket address behind `addr`.
///
/// Each resolved address gets its own `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for socket_addr in resolve(addr).await? {
        match tokio::time::timeout(timeout, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Ok(Err(e)) => {
                tracing::debug!(%socket_addr, error = %e, "Connect attempt failed");
                last_err = Some(e.to_string());
            },
            Err(_) => {
                tracing::debug!(%socket_addr, ?timeout, "Connect attempt timed out");
                last_err = Some(format!("timed out after {timeout:?}"));
            },
        }
    }

    Err(RpcError::CommunicationFailure(format!(
        "failed to connect to {addr}: {}",
        last_err.unwrap_or_else(|| "unknown error".to_string())
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_address_list() {
        assert_eq!(
            parse_address_list(" a:1, b:2 ,,c:3 "),
            vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]
        );
        assert!(parse_address_list("").is_empty());
    }

    #[tokio::test]
    async fn test_connect_localhost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stream = connect(&addr, Duration::from_secs(1)).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect(&addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RpcError::CommunicationFailure(_)));
    }

    #[tokio::test]
    async fn test_unresolvable() {
        assert!(resolve("not a host").await.is_err());
    }
}
