// SPDX-License-Identifier: Apache-2.0

use crate::listener::Listener;
use crate::tailer::WebhookHandler;

use http::Method;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use prometheus::{Encoder, Registry, TextEncoder};

use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::error;

/// HTTP server exposing the Prometheus text exposition at the configured
/// scrape path and, for webhook input, accepting log lines via POST.
pub struct MetricsServer {
    registry: Registry,
    metrics_path: String,
    webhook: Option<(String, WebhookHandler)>,
}

impl MetricsServer {
    pub fn new(
        registry: Registry,
        metrics_path: impl Into<String>,
        webhook: Option<(String, WebhookHandler)>,
    ) -> Self {
        Self {
            registry,
            metrics_path: metrics_path.into(),
            webhook,
        }
    }

    /// Starts the server and serves requests until cancelled
    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let svc = ScrapeService {
            registry: self.registry.clone(),
            metrics_path: Arc::from(self.metrics_path.as_str()),
            webhook: self
                .webhook
                .as_ref()
                .map(|(path, handler)| (Arc::from(path.as_str()), handler.clone())),
        };

        // To bridge Tower->Hyper we must wrap the tower service
        let svc = TowerToHyperService::new(svc);

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);

        let listener = listener.into_async()?;
        // We start a loop to continuously accept incoming connections
        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            let io = TokioIo::new(stream);

            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                let _ = fut.await.map_err(|e| {
                    error!("error serving scrape connection: {:?}", e);
                });
            });
        }

        // gracefully shutdown existing connections
        graceful.shutdown().await;

        Ok(())
    }
}

#[derive(Clone)]
struct ScrapeService {
    registry: Registry,
    metrics_path: Arc<str>,
    webhook: Option<(Arc<str>, WebhookHandler)>,
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap()
}

impl<H> Service<Request<H>> for ScrapeService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync,
    <H as Body>::Error: Display + Debug + Send + Sync,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        let registry = self.registry.clone();
        let metrics_path = self.metrics_path.clone();
        let webhook = self.webhook.clone();

        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();

            if method == Method::GET && path == metrics_path.as_ref() {
                let metric_families = registry.gather();
                let encoder = TextEncoder::new();
                let mut output = Vec::new();
                return match encoder.encode(&metric_families, &mut output) {
                    Ok(()) => Ok(Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Full::new(Bytes::from(output)))
                        .unwrap()),
                    Err(err) => Ok(text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to encode metrics: {}", err),
                    )),
                };
            }

            if let Some((webhook_path, handler)) = webhook {
                if method == Method::POST && path == webhook_path.as_ref() {
                    let body = match req.into_body().collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(err) => {
                            return Ok(text_response(
                                StatusCode::BAD_REQUEST,
                                format!("failed to read request body: {}", err),
                            ))
                        }
                    };
                    return match handler.accept(&body).await {
                        Ok(accepted) => Ok(text_response(
                            StatusCode::OK,
                            format!("accepted {} lines\n", accepted),
                        )),
                        Err(err) => Ok(text_response(StatusCode::BAD_REQUEST, err.to_string())),
                    };
                }
            }

            // Return 404 Not Found for other routes
            Ok(text_response(StatusCode::NOT_FOUND, "Not Found"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::{Tail, WebhookFormat, WebhookTailer};
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioTimer;
    use opentelemetry::metrics::MeterProvider;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::timeout;

    fn http_client() -> Client<HttpConnector, Full<Bytes>> {
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(2)
            .timer(TokioTimer::new())
            .build::<_, Full<Bytes>>(HttpConnector::new())
    }

    #[tokio::test]
    async fn serves_prometheus_text_exposition() {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        let meter = provider.meter("test_meter");
        let counter = meter.u64_counter("tailmet_test_lines").build();
        counter.add(42, &[]);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(addr).unwrap();
        let bound_addr = listener.bound_address().unwrap();

        let server = MetricsServer::new(registry, "/metrics", None);
        let cancellation = CancellationToken::new();
        let cancel_handle = cancellation.clone();

        let server_handle = tokio::spawn(async move { server.serve(listener, cancellation).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = http_client();
        let uri = format!("http://{}/metrics", bound_addr);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("Request timed out")
            .expect("Request failed");

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let body_str = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert!(body_str.contains("tailmet_test_lines"));

        // 404 on other paths
        let uri = format!("http://{}/invalid", bound_addr);
        let response = timeout(Duration::from_secs(5), client.get(uri.parse().unwrap()))
            .await
            .expect("Request timed out")
            .expect("Request failed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        cancel_handle.cancel();
        timeout(Duration::from_secs(5), server_handle)
            .await
            .expect("Server shutdown timed out")
            .expect("Server task failed")
            .expect("Server returned error");
    }

    #[tokio::test]
    async fn webhook_post_delivers_lines() {
        let tailer = WebhookTailer::new("/webhook", WebhookFormat::TextBulk);
        let handler = tailer.handler();
        let lines = tailer.lines();

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(addr).unwrap();
        let bound_addr = listener.bound_address().unwrap();

        let server = MetricsServer::new(
            Registry::new(),
            "/metrics",
            Some(("/webhook".to_string(), handler)),
        );
        let cancellation = CancellationToken::new();
        let cancel_handle = cancellation.clone();
        let server_handle = tokio::spawn(async move { server.serve(listener, cancellation).await });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = http_client();
        let uri: hyper::Uri = format!("http://{}/webhook", bound_addr).parse().unwrap();
        let req = Request::post(uri)
            .body(Full::new(Bytes::from("alpha\nbeta\n")))
            .unwrap();
        let response = timeout(Duration::from_secs(5), client.request(req))
            .await
            .expect("Request timed out")
            .expect("Request failed");
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(lines.try_recv().unwrap().text, "alpha");
        assert_eq!(lines.try_recv().unwrap().text, "beta");

        cancel_handle.cancel();
        timeout(Duration::from_secs(5), server_handle)
            .await
            .expect("Server shutdown timed out")
            .expect("Server task failed")
            .expect("Server returned error");
    }
}
