//! The loopback HTTP listener that desktop clients query for free/busy data
//!
//! A [`Gateway`] is either stopped or running. Starting it binds `127.0.0.1:<port>` and spawns the
//! accept loop; each connection is then served by its own task. Stopping it is best-effort: the
//! accept loop is cancelled at once, then the gateway waits a short grace period for in-flight
//! requests before abandoning them.

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::AddressBook;
use crate::client::Client;
use crate::config::{GatewayConfiguration, GatewaySettings};
use crate::error::GatewayError;
use crate::resolver::FreeBusyResolver;
use crate::traits::Upstream;
use routes::RequestContext;

struct RunningGateway {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Gateway {
    config: GatewayConfiguration,
    settings: GatewaySettings,
    /// Replaces the HTTP client to the server, if set
    upstream: Option<Arc<dyn Upstream>>,

    running: Option<RunningGateway>,
}

impl Gateway {
    /// Create a gateway. This does not bind anything yet
    pub fn new(config: GatewayConfiguration, settings: GatewaySettings) -> Self {
        Self { config, settings, upstream: None, running: None }
    }

    /// Create a gateway that talks to a custom [`Upstream`] rather than to a real server
    pub fn with_upstream(config: GatewayConfiguration, settings: GatewaySettings, upstream: Arc<dyn Upstream>) -> Self {
        Self { config, settings, upstream: Some(upstream), running: None }
    }

    pub fn configuration(&self) -> &GatewayConfiguration { &self.config }
    pub fn settings(&self) -> &GatewaySettings { &self.settings }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The address the gateway listens to, if it is running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// The URL template that the client should be configured with.
    ///
    /// `%NAME%` and `%SERVER%` are replaced by the client with the local-part and the domain of the attendee.
    pub fn url_template(&self) -> String {
        let port = self.local_addr().map(|addr| addr.port()).unwrap_or(self.settings.port);
        match self.settings.trimmed_prefix() {
            "" => format!("http://127.0.0.1:{}/freebusy/%NAME%@%SERVER%.vfb", port),
            prefix => format!("http://127.0.0.1:{}/{}/freebusy/%NAME%@%SERVER%.vfb", port, prefix),
        }
    }

    /// Bind the listener and start serving requests. This is a no-op if the gateway is already running.
    ///
    /// Returns the address the gateway listens to.
    pub async fn start(&mut self) -> Result<SocketAddr, GatewayError> {
        if let Some(running) = &self.running {
            log::debug!("Gateway already listening on {}", running.local_addr);
            return Ok(running.local_addr);
        }
        if self.config.is_complete() == false {
            log::error!("Cannot start the gateway: configuration is incomplete");
            return Err(GatewayError::ConfigurationIncomplete);
        }

        let upstream: Arc<dyn Upstream> = match &self.upstream {
            Some(upstream) => Arc::clone(upstream),
            None => Arc::new(Client::new(&self.config, self.settings.request_timeout)?),
        };
        let address_book = Arc::new(AddressBook::new(Arc::clone(&upstream), &self.config, &self.settings));
        let resolver = FreeBusyResolver::new(upstream, Arc::clone(&address_book));
        let context = RequestContext::new(address_book, resolver, &self.settings.prefix, self.settings.window_days());
        let app = routes::router(Arc::new(context));

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], self.settings.port))).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    // A dropped sender means the gateway itself has been dropped
                    let _ = shutdown_signal.await;
                });
            if let Err(err) = server.await {
                log::error!("Gateway on {} stopped unexpectedly: {}", local_addr, err);
            }
        });

        log::info!("Gateway listening on http://{}", local_addr);
        self.running = Some(RunningGateway { local_addr, shutdown, task });
        Ok(local_addr)
    }

    /// Stop accepting connections, and wait (a bit) for in-flight requests. This is a no-op if the gateway is not running
    pub async fn stop(&mut self) {
        let running = match self.running.take() {
            None => return,
            Some(running) => running,
        };
        log::info!("Stopping the gateway on {}", running.local_addr);

        let _ = running.shutdown.send(());
        let mut task = running.task;
        match tokio::time::timeout(self.settings.shutdown_grace, &mut task).await {
            Ok(_) => log::info!("Gateway stopped"),
            Err(_) => {
                log::warn!("Gateway did not settle within {:?}, abandoning in-flight requests", self.settings.shutdown_grace);
                task.abort();
            },
        }
    }

    /// Replace the configuration, restarting the gateway if it was running
    pub async fn reconfigure(&mut self, config: GatewayConfiguration) -> Result<(), GatewayError> {
        let was_running = self.is_running();
        self.stop().await;
        self.config = config;
        if was_running {
            self.start().await?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::mock_upstream::MockUpstream;
    use crate::traits::DavResponse;

    const DIRECTORY: &str = "BEGIN:VCARD
VERSION:3.0
UID:john
EMAIL:john@example.com
END:VCARD
BEGIN:VCARD
VERSION:3.0
UID:alice
EMAIL:alice@example.com
END:VCARD
";

    /// A server whose calendar queries either panic or never answer
    struct FaultyUpstream {
        report_delay: Option<Duration>,
    }

    #[async_trait]
    impl Upstream for FaultyUpstream {
        async fn export_address_book(&self) -> Result<DavResponse, GatewayError> {
            Ok(DavResponse::new(200, Some("text/vcard"), DIRECTORY))
        }

        async fn free_busy_report(&self, _uid: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Result<DavResponse, GatewayError> {
            match self.report_delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(DavResponse::new(404, None, ""))
                },
                None => panic!("calendar backend exploded"),
            }
        }

        async fn post_to_outbox(&self, _originator: &str, _recipient: &str, _itip: String) -> Result<DavResponse, GatewayError> {
            Ok(DavResponse::new(404, None, ""))
        }
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn settings(dir: &std::path::Path) -> GatewaySettings {
        GatewaySettings {
            port: 0,
            data_dir: dir.to_path_buf(),
            ..GatewaySettings::default()
        }
    }

    #[tokio::test]
    async fn incomplete_configuration_does_not_bind() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfiguration::new("https://cloud.example.com", "john", "");
        let mut gateway = Gateway::with_upstream(config, settings(dir.path()), Arc::new(MockUpstream::with_directory("")));

        assert_eq!(gateway.start().await, Err(GatewayError::ConfigurationIncomplete));
        assert_eq!(gateway.is_running(), false);
    }

    #[tokio::test]
    async fn lifecycle() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfiguration::new("https://cloud.example.com", "john", "secret");
        let mut gateway = Gateway::with_upstream(config, settings(dir.path()), Arc::new(MockUpstream::with_directory("")));

        let addr = gateway.start().await.unwrap();
        assert_eq!(gateway.start().await.unwrap(), addr);
        assert_eq!(gateway.url_template(), format!("http://127.0.0.1:{}/ifb/freebusy/%NAME%@%SERVER%.vfb", addr.port()));

        gateway.stop().await;
        assert_eq!(gateway.is_running(), false);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        gateway.stop().await;

        // A restart binds a new listener
        gateway.start().await.unwrap();
        assert!(gateway.is_running());

        let other = GatewayConfiguration::new("https://cloud.example.com", "alice", "secret");
        gateway.reconfigure(other.clone()).await.unwrap();
        assert!(gateway.is_running());
        assert_eq!(gateway.configuration(), &other);

        gateway.reconfigure(GatewayConfiguration::new("", "alice", "secret")).await.unwrap_err();
        assert_eq!(gateway.is_running(), false);
    }

    #[tokio::test]
    async fn handler_panics_do_not_stop_the_listener() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfiguration::new("https://cloud.example.com", "john", "secret");
        let upstream = Arc::new(FaultyUpstream { report_delay: None });
        let mut gateway = Gateway::with_upstream(config, settings(dir.path()), upstream);
        let addr = gateway.start().await.unwrap();

        for _ in 0..2 {
            let response = http().get(format!("http://{}/ifb/freebusy/alice.vfb", addr)).send().await.unwrap();
            assert_eq!(response.status().as_u16(), 500);
            assert_eq!(response.text().await.unwrap(), "internal error");
        }

        // Requests that do not reach the faulty code are still served
        let response = http().get(format!("http://{}/ifb/freebusy/nobody.vfb", addr)).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert!(gateway.is_running());

        gateway.stop().await;
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_stuck_requests() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfiguration::new("https://cloud.example.com", "john", "secret");
        let upstream = Arc::new(FaultyUpstream { report_delay: Some(Duration::from_secs(20)) });
        let settings = GatewaySettings {
            shutdown_grace: Duration::from_millis(300),
            ..settings(dir.path())
        };
        let mut gateway = Gateway::with_upstream(config, settings, upstream);
        let addr = gateway.start().await.unwrap();

        let stuck = tokio::spawn(async move {
            http().get(format!("http://{}/ifb/freebusy/alice.vfb", addr)).send().await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        gateway.stop().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "stop returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "stop returned after {:?}", elapsed);

        assert_eq!(gateway.is_running(), false);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        stuck.abort();
    }
}
