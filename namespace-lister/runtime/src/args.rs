use crate::{
    core::{NamespaceLister, SyncConfig, SyncMetrics, Synchronizer},
    http::{Authenticator, HttpMetrics, NamespacesService, TokenReviewer},
    index::{synchronize_when_ready, Index, IndexMetrics, Store},
    k8s::{self, watcher, GoDuration, Selector},
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "namespace-lister",
    about = "Lists the namespaces a user is allowed to get"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "namespace_lister=info,warn",
        env = "NAMESPACE_LISTER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// How often the access cache is rebuilt when nothing changes.
    ///
    /// Zero uses the default of 10m.
    #[clap(long, default_value = "0", env = "CACHE_RESYNC_PERIOD")]
    cache_resync_period: GoDuration,

    /// Only namespaces matching this label selector are listed.
    #[clap(long, env = "CACHE_NAMESPACE_LABELSELECTOR")]
    namespace_label_selector: Option<Selector>,

    /// A request header whose value is trusted as the caller's username.
    ///
    /// Requests without it are authenticated by reviewing their bearer token.
    #[clap(long, env = "AUTH_USERNAME_HEADER")]
    username_header: Option<::http::HeaderName>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            cache_resync_period,
            namespace_label_selector,
            username_header,
        } = self;

        let mut prom = <Registry>::default();
        let lister_registry = prom.sub_registry_with_prefix("namespace_lister");
        let index_metrics = IndexMetrics::register(lister_registry);
        let sync_metrics = SyncMetrics::register(lister_registry);
        let http_metrics = HttpMetrics::register(prom.sub_registry_with_prefix("http"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        // Build the mirror of the cluster's RBAC state and the synchronizer that rebuilds the
        // access cache from it. Once every watch has delivered its initial state, each index
        // update requests a rebuild.
        let index = Index::shared(index_metrics);
        let sync = Synchronizer::new(
            Store::new(index.clone()),
            SyncConfig::default()
                .with_resync_period(cache_resync_period.into())
                .with_metrics(sync_metrics),
        );
        index.write().set_requester(sync.requester());

        // Spawn resource watches.

        let namespaces_config = match namespace_label_selector.as_ref() {
            Some(selector) => {
                let labels = selector.to_string();
                info!(%labels, "Watching selected namespaces");
                watcher::Config::default().labels(&labels)
            }
            None => watcher::Config::default(),
        };
        let namespaces = runtime.watch_all::<k8s::Namespace>(namespaces_config);
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        let roles = runtime.watch_all::<k8s::Role>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), roles).instrument(info_span!("roles")),
        );

        let role_bindings = runtime.watch_all::<k8s::RoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), role_bindings)
                .instrument(info_span!("rolebindings")),
        );

        let cluster_roles = runtime.watch_all::<k8s::ClusterRole>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), cluster_roles)
                .instrument(info_span!("clusterroles")),
        );

        let cluster_role_bindings =
            runtime.watch_all::<k8s::ClusterRoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), cluster_role_bindings)
                .instrument(info_span!("clusterrolebindings")),
        );

        // Run the synchronizer from the time the index is ready until the runtime is asked to
        // shut down.
        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_shutdown(runtime.shutdown_handle(), shutdown.clone()));
        let ready = index.read().ready();
        tokio::spawn(
            synchronize_when_ready(ready, sync.clone(), shutdown).instrument(info_span!("startup")),
        );

        // Serve listings from the access cache.
        let lister = NamespaceLister::new(sync.cache().clone());
        let authn = Authenticator::new(username_header, Some(TokenReviewer::new(runtime.client())));
        let service = NamespacesService::new(lister, authn, http_metrics);
        let runtime = runtime.spawn_server(move || service.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn cancel_on_shutdown(drain: drain::Watch, shutdown: CancellationToken) {
    let release = drain.signaled().await;
    shutdown.cancel();
    drop(release);
}
