// SPDX-License-Identifier: Apache-2.0

//! TCP listener for the scrape endpoint, bound ahead of the runtime.
//!
//! The socket is bound (and set listening) during early init, before the
//! tokio runtime exists, so a bad `--listen` address fails startup instead of
//! surfacing after tailing has already begun. The server task converts it to
//! a tokio listener when its accept loop starts.

use std::error::Error;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use tokio::net::TcpListener as AsyncTcpListener;

pub struct Listener {
    inner: StdTcpListener,
}

impl Listener {
    /// Bind and listen on `endpoint`. Callable outside a tokio runtime; the
    /// socket is ready to accept() after success here.
    pub fn bind(endpoint: SocketAddr) -> Result<Self, Box<dyn Error + Send + Sync>> {
        match StdTcpListener::bind(endpoint) {
            Ok(inner) => Ok(Self { inner }),
            Err(e) => Err(format!("unable to bind to {}: {}", endpoint, e).into()),
        }
    }

    pub fn bound_address(&self) -> Result<SocketAddr, Box<dyn Error + Send + Sync>> {
        Ok(self.inner.local_addr()?)
    }

    /// Convert into a tokio listener for the accept loop. Must run inside a
    /// runtime.
    pub fn into_async(self) -> Result<AsyncTcpListener, Box<dyn Error + Send + Sync>> {
        self.inner.set_nonblocking(true)?;
        Ok(AsyncTcpListener::from_std(self.inner)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_assigns_an_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.bound_address().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn converts_to_async_listener() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.bound_address().unwrap();

        let async_listener = listener.into_async().unwrap();
        assert_eq!(async_listener.local_addr().unwrap(), addr);
    }

    #[test]
    fn bind_error_names_the_endpoint() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.bound_address().unwrap();

        // second bind on the same port fails while the first is alive
        let err = Listener::bind(addr).err().unwrap();
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
