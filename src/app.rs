//! Service wiring: builds every component from settings and runs them

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::access::AccessControl;
use crate::api::{ApiServer, ApiState, Management, DEFAULT_MAX_BODY};
use crate::catalog::{CatalogStore, CatalogSync, JsonCatalogStore, MemoryCatalogStore};
use crate::config::{Settings, StorageBackend};
use crate::error::Result;
use crate::identity::Identity;
use crate::listener::dns::{DnsTcpListener, DnsUdpListener};
use crate::listener::http::HttpListener;
use crate::listener::smtp::SmtpListener;
use crate::listener::{tls, CaptureContext, ListenerSet};
use crate::models::User;
use crate::recorder::Recorder;
use crate::registry::ZoneRegistry;
use crate::rules::RuleEngine;
use crate::storage::{JsonlRequestStore, MemoryRequestStore, RequestStore};

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Every long-lived component of a running service
pub struct App {
    pub settings: Settings,
    pub registry: Arc<ZoneRegistry>,
    pub rules: Arc<RuleEngine>,
    pub access: Arc<AccessControl>,
    pub identity: Arc<Identity>,
    pub store: Arc<dyn RequestStore>,
    pub recorder: Arc<Recorder>,
    pub capture: Arc<CaptureContext>,
    pub catalog: Arc<CatalogSync>,
}

impl App {
    /// Builds the components, restores the saved catalog and seeds
    /// configured users and any configured domain not already present
    pub async fn build(settings: Settings) -> Result<Self> {
        let registry = Arc::new(ZoneRegistry::new());
        let rules = Arc::new(RuleEngine::new());
        let access = Arc::new(AccessControl::new(
            Arc::clone(&registry),
            settings.api.public_owner.clone(),
        ));
        let identity = Arc::new(Identity::new(chrono::Duration::minutes(
            settings.api.session_minutes,
        )));

        let retention = settings.storage.retention;
        let (store, catalog_store): (Arc<dyn RequestStore>, Arc<dyn CatalogStore>) =
            match settings.storage.backend {
                StorageBackend::Memory => (
                    Arc::new(MemoryRequestStore::with_retention(retention)),
                    Arc::new(MemoryCatalogStore::new()),
                ),
                StorageBackend::Jsonl => (
                    Arc::new(JsonlRequestStore::open_with(&settings.storage.path, retention).await?),
                    Arc::new(JsonCatalogStore::new(settings.storage.catalog_file())),
                ),
            };
        let catalog = Arc::new(CatalogSync::new(
            Arc::clone(&registry),
            Arc::clone(&access),
            Arc::clone(&rules),
            catalog_store,
        ));
        catalog.restore().await?;

        let recorder = Arc::new(Recorder::new(Arc::clone(&store), settings.storage.retry));
        let capture = Arc::new(CaptureContext::new(
            Arc::clone(&registry),
            Arc::clone(&rules),
            Arc::clone(&recorder),
            settings.limits.clone(),
        ));

        let app = Self {
            settings,
            registry,
            rules,
            access,
            identity,
            store,
            recorder,
            capture,
            catalog,
        };
        app.seed()?;
        app.catalog.persist().await?;
        Ok(app)
    }

    fn seed(&self) -> Result<()> {
        for seed in &self.settings.users {
            self.identity.add_user(User {
                username: seed.username.clone(),
                full_name: seed.full_name.clone(),
                roles: seed.roles.clone(),
                password_hash: seed.password_hash.clone(),
            })?;
        }
        for seed in &self.settings.domains {
            if self.registry.domain(&seed.domain).is_some() {
                debug!("Domain {} restored from catalog, not seeding", seed.domain);
                continue;
            }
            let ips = seed.public_ips.iter().copied().collect();
            self.registry
                .register_domain(&seed.domain, ips, &seed.owner)?;
            if !seed.users.is_empty() {
                self.registry.add_domain_users(&seed.domain, &seed.users)?;
            }
        }
        info!(
            "Seeded {} user(s) and {} domain(s)",
            self.settings.users.len(),
            self.settings.domains.len()
        );
        Ok(())
    }

    pub fn management(&self) -> Management {
        Management::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.access),
            Arc::clone(&self.identity),
            Arc::clone(&self.rules),
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
        )
    }

    /// Loads the TLS identity; failures only disable the TLS ports
    fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        match (&self.settings.tls.cert_file, &self.settings.tls.key_file) {
            (Some(cert), Some(key)) => match tls::load_acceptor(cert, key) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!("TLS ports disabled: {}", e);
                    None
                }
            },
            _ => {
                info!("No TLS certificate configured, TLS ports disabled");
                None
            }
        }
    }

    /// Binds every enabled listener
    pub async fn listeners(&self) -> Result<ListenerSet> {
        let s = &self.settings;
        let ctx = &self.capture;
        let tls = self.tls_acceptor();
        let mut set = ListenerSet::new();

        if s.dns.enabled {
            let addr = SocketAddr::new(s.dns.interface, s.dns.port);
            set.register(Arc::new(
                DnsUdpListener::bind(addr, Arc::clone(ctx), s.dns.ttl).await?,
            ));
            if s.dns.tcp {
                set.register(Arc::new(
                    DnsTcpListener::bind(addr, Arc::clone(ctx), s.dns.ttl).await?,
                ));
            }
        }

        if s.smtp.enabled {
            for port in [Some(s.smtp.port), s.smtp.submission_port].into_iter().flatten() {
                let addr = SocketAddr::new(s.smtp.interface, port);
                set.register(Arc::new(
                    SmtpListener::bind(addr, Arc::clone(ctx), s.smtp.hostname.clone(), None)
                        .await?,
                ));
            }
            if let (Some(port), Some(acceptor)) = (s.smtp.ssl_port, &tls) {
                let addr = SocketAddr::new(s.smtp.interface, port);
                set.register(Arc::new(
                    SmtpListener::bind(
                        addr,
                        Arc::clone(ctx),
                        s.smtp.hostname.clone(),
                        Some(acceptor.clone()),
                    )
                    .await?,
                ));
            }
        }

        if s.http.enabled {
            let addr = SocketAddr::new(s.http.interface, s.http.port);
            set.register(Arc::new(HttpListener::bind(addr, Arc::clone(ctx), None).await?));
            if let (Some(port), Some(acceptor)) = (s.http.tls_port, &tls) {
                let addr = SocketAddr::new(s.http.interface, port);
                set.register(Arc::new(
                    HttpListener::bind(addr, Arc::clone(ctx), Some(acceptor.clone())).await?,
                ));
            }
        }

        Ok(set)
    }

    pub async fn api_server(&self) -> Result<ApiServer> {
        let state = Arc::new(ApiState {
            management: self.management(),
            api_host: self.settings.api.api_host.clone(),
            max_body: DEFAULT_MAX_BODY,
        });
        let addr = SocketAddr::new(self.settings.api.interface, self.settings.api.port);
        ApiServer::bind(addr, state).await
    }

    /// Runs listeners and the API until Ctrl+C
    pub async fn run(self) -> Result<()> {
        let listeners = self.listeners().await?;
        let mut handles: Vec<JoinHandle<()>> = listeners.spawn_all();

        if self.settings.api.enabled {
            let api = self.api_server().await?;
            handles.push(tokio::spawn(async move {
                if let Err(e) = api.run().await {
                    error!("Management API stopped: {}", e);
                }
            }));
        }

        let identity = Arc::clone(&self.identity);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SESSION_PURGE_INTERVAL);
            loop {
                tick.tick().await;
                let purged = identity.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired session(s)", purged);
                }
            }
        }));

        tokio::signal::ctrl_c().await?;
        info!(
            "Shutting down ({} record(s) dropped this run)",
            self.recorder.dropped()
        );
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }
}
