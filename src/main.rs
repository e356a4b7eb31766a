use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Arg, ArgMatches, Command};
use eyre::{WrapErr, eyre};
use kubedeck::{
    AppState, Config, KubeCluster, PortPair, Session, SessionRegistry, SessionStatus,
    TunnelEstablisher,
};
use tokio::signal;
use tracing::{error, info, warn};

fn cli() -> Command {
    Command::new("kubedeck")
        .version(env!("CARGO_PKG_VERSION"))
        .author("akagi201")
        .about("Kubernetes port-forwarding and live log streaming service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("kubeconfig")
                .long("kubeconfig")
                .value_name("FILE")
                .global(true)
                .help("Path to the kubeconfig file"),
        )
        .arg(
            Arg::new("context")
                .long("context")
                .value_name("NAME")
                .global(true)
                .help("Kubeconfig context to use"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .global(true)
                .help("Increase logging verbosity"),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the HTTP API (default)")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("ADDR")
                        .help("Address to listen on"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16))
                        .help("Port to listen on"),
                ),
        )
        .subcommand(
            Command::new("forward")
                .about("Forward local ports to a pod until interrupted")
                .arg(
                    Arg::new("target")
                        .value_name("NAMESPACE/POD")
                        .required(true)
                        .help("Pod to forward to"),
                )
                .arg(
                    Arg::new("ports")
                        .value_name("LOCAL:REMOTE,...")
                        .required(true)
                        .help("Port pairs, e.g. 18080:8080,9090"),
                ),
        )
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let matches = cli().get_matches();

    kubedeck::init_logging(matches.get_count("verbose"))?;

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(path) = &config_path {
        info!("Loaded configuration from {}", path.display());
    }

    if let Some(kubeconfig) = matches.get_one::<String>("kubeconfig") {
        config.kube.kubeconfig = Some(kubeconfig.clone());
    }
    if let Some(context) = matches.get_one::<String>("context") {
        config.kube.context = Some(context.clone());
    }

    match matches.subcommand() {
        Some(("forward", sub)) => forward(config, sub).await,
        Some(("serve", sub)) => {
            if let Some(host) = sub.get_one::<String>("host") {
                config.server.host = host.clone();
            }
            if let Some(port) = sub.get_one::<u16>("port") {
                config.server.port = *port;
            }
            serve(config).await
        }
        _ => serve(config).await,
    }
}

async fn connect(config: &Config) -> eyre::Result<KubeCluster> {
    let bind_address: IpAddr = config
        .tunnel
        .bind_address
        .parse()
        .wrap_err("Invalid tunnel bind address")?;
    let cluster = KubeCluster::connect(&config.kube, bind_address)
        .await
        .wrap_err("Failed to configure Kubernetes client")?;

    match cluster.check_connection().await {
        Ok(version) => info!("Connected to Kubernetes API server {}", version),
        Err(e) => warn!("Kubernetes API server is not reachable yet: {}", e),
    }

    Ok(cluster)
}

async fn serve(config: Config) -> eyre::Result<()> {
    config.validate()?;
    let cluster = connect(&config).await?;

    let address = config.listen_address();
    let state = AppState::new(Arc::new(cluster), config);
    let app = kubedeck::api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind {address}"))?;
    info!("Listening on http://{}", address);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C, shutting down...");
            let sessions = shutdown_state.sessions.stop_all().await;
            shutdown_state.streams.stop_all().await;
            info!("Stopped {} port-forward session(s)", sessions);
        })
        .await?;

    // give establishers a moment to unwind their tunnels
    let deadline = tokio::time::Instant::now() + state.config.tunnel.stop_grace();
    while !state.sessions.is_empty().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn forward(config: Config, matches: &ArgMatches) -> eyre::Result<()> {
    let target = matches
        .get_one::<String>("target")
        .ok_or_else(|| eyre!("missing target"))?;
    let (namespace, pod) = target
        .split_once('/')
        .ok_or_else(|| eyre!("target must be NAMESPACE/POD, got '{target}'"))?;
    let ports = matches
        .get_one::<String>("ports")
        .ok_or_else(|| eyre!("missing ports"))?;
    let ports = PortPair::parse_list(ports)?;

    let cluster = Arc::new(connect(&config).await?);
    let registry = SessionRegistry::new();
    let establisher = TunnelEstablisher::new(
        cluster,
        registry.clone(),
        config.tunnel.ready_timeout(),
        config.tunnel.stop_grace(),
    );

    let session = Arc::new(Session::new(namespace, pod, ports)?);
    registry.add(Arc::clone(&session)).await;
    let handle = establisher.spawn(Arc::clone(&session));

    let state = session
        .wait_until_settled(config.tunnel.ready_timeout() + Duration::from_secs(1))
        .await;
    if state.status != SessionStatus::Running {
        registry.stop(session.id()).await;
        let _ = handle.await;
        let reason = session.state().error.unwrap_or_else(|| "not ready".to_string());
        return Err(eyre!("Port-forward failed to start: {reason}"));
    }

    for pair in session.ports() {
        info!(
            "Forwarding {}:{} -> {}/{}:{}",
            config.tunnel.bind_address, pair.local_port, namespace, pod, pair.remote_port
        );
    }
    info!("Press Ctrl+C to stop.");

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("Received Ctrl+C, shutting down...");
            registry.stop(session.id()).await;
        }
        _ = session.wait_until_terminal(Duration::MAX) => {}
    }

    if let Err(e) = handle.await {
        error!("Establisher task join error: {}", e);
    }

    let final_state = session.state();
    match final_state.status {
        SessionStatus::Error => Err(eyre!(
            "Port-forward ended: {}",
            final_state.error.unwrap_or_default()
        )),
        _ => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}
