//! Purpose: Provide the HTTP/JSON export endpoint.
//! Exports: `ServeConfig`, `serve`, `prepare_self_signed_tls`.
//! Role: Axum server wiring the access gate and exporter to `GET <mount>`.
//! Invariants: Gate order is transport, then credentials, then class checks.
//! Invariants: Every rejection is a JSON `{"error":{"status","message"}}` with matching status.
//! Invariants: Loopback-only unless explicitly allowed; TLS requests are tagged as secure.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rcgen::{Certificate, CertificateParams, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::future::IntoFuture;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use search_data_extractor::api::{
    BasicAuth, Environment, Error, ErrorKind, ExportRequest, Exporter, MemoryStore, Transport,
    TransportPolicy, to_http_status,
};
use search_data_extractor::config::{ExtractorConfig, load_members};
use search_data_extractor::data_dir::load_store;

pub const DEFAULT_MOUNT: &str = "/api/v1/search-data-extractor";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub mount: String,
    pub environment: Environment,
    pub https_override: bool,
    pub trust_forwarded_proto: bool,
    pub allow_non_loopback: bool,
    pub config_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub members_path: PathBuf,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_self_signed: bool,
}

pub(crate) struct AppState {
    exporter: Exporter,
    auth: BasicAuth,
    policy: TransportPolicy,
}

impl AppState {
    pub(crate) fn new(exporter: Exporter, auth: BasicAuth, policy: TransportPolicy) -> Self {
        Self {
            exporter,
            auth,
            policy,
        }
    }
}

pub(crate) struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    pub(crate) fingerprint: String,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let extractor = match &config.config_path {
        Some(path) => ExtractorConfig::load(path)?,
        None => ExtractorConfig::default(),
    };
    let store = load_store(&config.data_dir)?;
    let members = load_members(&config.members_path)?;
    let registry = extractor.build_registry()?;
    if members.is_empty() {
        tracing::warn!(path = %config.members_path.display(), "members file is empty; every request will be rejected");
    }
    log_store(&store);

    let mut exporter = Exporter::new(Arc::new(store), Arc::new(registry), extractor.settings())?;
    if let Some(hook) = extractor.metadata_hook() {
        exporter = exporter.with_hook(hook);
    }
    let allowed: Vec<String> = exporter.allow_list().into_keys().collect();
    let policy = TransportPolicy::new(
        config.environment,
        config.https_override,
        config.trust_forwarded_proto,
    );
    if config.https_override && !policy.https_override() {
        tracing::warn!(
            environment = ?config.environment,
            "https override ignored outside the dev environment"
        );
    }
    if policy.https_override() {
        tracing::warn!("https check disabled for local development");
    }
    let auth = BasicAuth::new(
        extractor.realm.clone(),
        extractor.permission_code.clone(),
        Arc::new(members),
    );
    tracing::info!(
        realm = auth.realm(),
        permission = auth.permission_code(),
        page_size = exporter.settings().pagination_limit,
        "export gate configured"
    );
    let state = Arc::new(AppState::new(exporter, auth, policy));
    let app = router(state, &config.mount);

    let tls = if config.tls_self_signed {
        Some(prepare_self_signed_tls(config.bind.ip())?)
    } else if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        Some(load_tls_material(cert, key)?)
    } else {
        None
    };
    if tls.is_none() && !config.trust_forwarded_proto && !policy.https_override() {
        tracing::warn!("no TLS and no trusted proxy: export requests will be rejected as insecure");
    }

    let listener = TcpListener::bind(config.bind).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to bind server")
            .with_source(err)
    })?;

    tracing::info!(
        bind = %config.bind,
        mount = %config.mount,
        scheme = if tls.is_some() { "https" } else { "http" },
        allowed = ?allowed,
        "search data extractor listening"
    );

    match tls {
        Some(material) => {
            tracing::info!(fingerprint = %material.fingerprint, "tls enabled");
            let acceptor = tls_acceptor(material)?;
            serve_tls(listener, app, acceptor, shutdown_signal()).await
        }
        None => serve_plain(listener, app).await,
    }
}

pub(crate) fn router(state: Arc<AppState>, mount: &str) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(mount, get(export_index))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve_plain(listener: TcpListener, app: Router) -> Result<(), Error> {
    let app = app.layer(Extension(Transport::Plain));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    let app = app.layer(Extension(Transport::Tls));
    let (close_tx, close_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            _ = &mut shutdown => break,
        };
        connections.spawn(serve_tls_connection(
            stream,
            peer,
            acceptor.clone(),
            app.clone(),
            close_rx.clone(),
        ));
    }

    drop(listener);
    let _ = close_tx.send(true);
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
    }
    Ok(())
}

async fn serve_tls_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    mut close: watch::Receiver<bool>,
) {
    let stream = tokio::select! {
        accepted = acceptor.accept(stream) => match accepted {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(%peer, error = %err, "tls handshake failed");
                return;
            }
        },
        _ = close.changed() => return,
    };
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::pin!(connection);
    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = close.changed() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };
    if let Err(err) = result {
        tracing::debug!(%peer, error = %err, "connection ended with error");
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub(crate) fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.tls_cert.is_some() != config.tls_key.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("TLS requires both --tls-cert and --tls-key")
            .with_hint("Provide both paths or use --tls-self-signed."));
    }

    if config.tls_self_signed && config.tls_cert.is_some() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--tls-self-signed cannot be combined with --tls-cert/--tls-key")
            .with_hint("Pick one TLS source."));
    }

    if !config.mount.starts_with('/') || config.mount.len() < 2 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("mount path must start with '/' and name a route")
            .with_hint(format!("Use a value like {DEFAULT_MOUNT}.")));
    }

    if config.mount == "/healthz" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("mount path collides with /healthz")
            .with_hint(format!("Use a value like {DEFAULT_MOUNT}.")));
    }

    Ok(())
}

fn log_store(store: &MemoryStore) {
    for record_type in store.record_types() {
        tracing::info!(record_type, records = store.len(record_type), "record type loaded");
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

pub(crate) fn prepare_self_signed_tls(bind_ip: IpAddr) -> Result<TlsMaterial, Error> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()]);
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    if !bind_ip.is_unspecified() && !bind_ip.is_loopback() {
        params.subject_alt_names.push(SanType::IpAddress(bind_ip));
    }
    let cert = Certificate::from_params(params).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to generate self-signed certificate")
            .with_source(err)
    })?;
    let cert_der = cert.serialize_der().map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode self-signed certificate")
            .with_source(err)
    })?;
    let key_der = cert.serialize_private_key_der();
    Ok(TlsMaterial {
        fingerprint: format_cert_fingerprint(&cert_der),
        certs: vec![CertificateDer::from(cert_der)],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
    })
}

fn load_tls_material(cert_path: &Path, key_path: &Path) -> Result<TlsMaterial, Error> {
    let cert_pem = read_pem(cert_path, "failed to read TLS certificate")?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid TLS certificate PEM")
                .with_path(cert_path)
                .with_source(err)
        })?;
    let Some(first) = certs.first() else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("TLS certificate file contains no certificates")
            .with_path(cert_path));
    };
    let fingerprint = format_cert_fingerprint(first.as_ref());

    let key_pem = read_pem(key_path, "failed to read TLS key")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid TLS key PEM")
                .with_path(key_path)
                .with_source(err)
        })?
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("TLS key file contains no private key")
                .with_path(key_path)
        })?;
    Ok(TlsMaterial {
        certs,
        key,
        fingerprint,
    })
}

fn read_pem(path: &Path, message: &str) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(message)
            .with_path(path)
            .with_source(err)
    })
}

fn tls_acceptor(material: TlsMaterial) -> Result<TlsAcceptor, Error> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(material.certs, material.key)
        .map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("TLS certificate and key do not form a usable pair")
                .with_source(err)
        })?;
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn format_cert_fingerprint(cert_der: &[u8]) -> String {
    let digest = Sha256::digest(cert_der);
    let mut output = String::from("SHA256:");
    for (idx, byte) in digest.iter().enumerate() {
        if idx > 0 {
            output.push(':');
        }
        output.push_str(&format!("{byte:02X}"));
    }
    output
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn export_index(
    State(state): State<Arc<AppState>>,
    transport: Option<Extension<Transport>>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Response {
    let transport = transport.map(|Extension(transport)| transport).unwrap_or_default();
    let forwarded_proto = header_str(&headers, "x-forwarded-proto");
    if let Err(err) = state.policy.check(transport, forwarded_proto) {
        return error_response(&state, err);
    }

    let authorization = header_str(&headers, header::AUTHORIZATION.as_str());
    let identity = match state.auth.authenticate(authorization) {
        Ok(identity) => identity,
        Err(err) => return error_response(&state, err),
    };

    let request = match query {
        Ok(Query(pairs)) => pairs.into_iter().collect::<ExportRequest>(),
        Err(rejection) => {
            return error_response(
                &state,
                Error::new(ErrorKind::Usage).with_message(rejection.body_text()),
            );
        }
    };

    let worker = Arc::clone(&state);
    let result =
        tokio::task::spawn_blocking(move || worker.exporter.export(&request, &identity)).await;
    match result {
        Ok(Ok(envelope)) => Json(envelope).into_response(),
        Ok(Err(err)) => error_response(&state, err),
        Err(join_err) => error_response(
            &state,
            Error::new(ErrorKind::Internal)
                .with_message("export task failed")
                .with_source(join_err),
        ),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    message: String,
}

fn error_response(state: &AppState, err: Error) -> Response {
    let status = to_http_status(err.kind());
    let message = if status >= 500 {
        tracing::error!(error = %err, "export failed");
        "Sorry an internal error occurred.".to_string()
    } else {
        tracing::debug!(status, error = %err, "request rejected");
        err.message().unwrap_or("error").to_string()
    };
    let body = ErrorEnvelope {
        error: ErrorBody { status, message },
    };
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status_code, Json(body)).into_response();
    if err.kind() == ErrorKind::Unauthenticated {
        if let Ok(value) = HeaderValue::from_str(&state.auth.challenge()) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}
