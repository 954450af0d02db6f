//! Purpose: End-to-end tests for the export endpoint served by the binary.
//! Exports: None (integration test module).
//! Role: Validate transport gate, Basic auth and pagination across TCP and TLS.
//! Invariants: Uses loopback-only server with temp data and members files.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use search_data_extractor::api::hash_password;
use serde_json::{Value, json};
use std::io::Read;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

const MOUNT: &str = "/api/v1/search-data-extractor";

struct Fixture {
    _temp: tempfile::TempDir,
    data_dir: PathBuf,
    members: PathBuf,
    config: PathBuf,
}

impl Fixture {
    fn new() -> TestResult<Self> {
        let temp = tempfile::tempdir()?;
        let data_dir = temp.path().join("data");
        std::fs::create_dir(&data_dir)?;
        std::fs::write(
            data_dir.join("Page.json"),
            json!([
                {"id": 1, "live": {"Title": "One", "Content": "first", "CanViewType": "Anyone"}},
                {"id": 2, "live": {"Title": "Two", "Content": "second", "CanViewType": "Anyone"}},
                {"id": 3, "live": {"Title": "Hidden", "Content": "secret", "CanViewType": "Nobody"}},
                {"id": 4, "draft": {"Title": "Draft only"}}
            ])
            .to_string(),
        )?;

        let members = temp.path().join("members.json");
        let member = |username: &str, password: &str, permissions: &[&str]| {
            json!({
                "username": username,
                "salt": "s4lt",
                "password_sha256": hash_password("s4lt", password),
                "permissions": permissions,
            })
        };
        std::fs::write(
            &members,
            json!([
                member("api-member", "api-member-pw", &["SEARCH_DATA_EXTRACTOR_ACCESS"]),
                member("author", "author-pw", &[]),
            ])
            .to_string(),
        )?;

        let config = temp.path().join("extractor.json");
        std::fs::write(
            &config,
            json!({
                "pagination_limit": 2,
                "models": {
                    "Page": {
                        "export": {"id": "ID", "title": "Title", "content": "Content"},
                        "visibility": "can_view_type"
                    },
                    "Member": {}
                },
                "envelope_metadata": {"source": "integration"}
            })
            .to_string(),
        )?;

        Ok(Self {
            _temp: temp,
            data_dir,
            members,
            config,
        })
    }
}

/// Server certificate written to disk for `--tls-cert/--tls-key`.
struct TlsFiles {
    cert: PathBuf,
    key: PathBuf,
    der: Vec<u8>,
}

impl TlsFiles {
    fn generate(dir: &Path) -> TestResult<Self> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert_pem = cert.serialize_pem()?;
        let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or("no certificate in generated PEM")??
            .as_ref()
            .to_vec();
        let files = Self {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            der,
        };
        std::fs::write(&files.cert, cert_pem)?;
        std::fs::write(&files.key, cert.serialize_private_key_pem())?;
        Ok(files)
    }
}

/// Accepts exactly one server certificate, whatever name it was issued for.
#[derive(Debug)]
struct PinnedCert {
    der: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.der.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("unexpected server certificate".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn pinned_agent(der: &[u8]) -> TestResult<ureq::Agent> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCert {
            der: der.to_vec(),
            provider,
        }))
        .with_no_client_auth();
    Ok(ureq::AgentBuilder::new().tls_config(Arc::new(config)).build())
}

struct TestServer {
    child: Child,
    base_url: String,
    agent: ureq::Agent,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(fixture: &Fixture, environment: &str, disable_https: Option<&str>) -> TestResult<Self> {
        Self::start_with_options(fixture, environment, disable_https, None)
    }

    fn start_tls(fixture: &Fixture, environment: &str, tls: &TlsFiles) -> TestResult<Self> {
        Self::start_with_options(fixture, environment, None, Some(tls))
    }

    fn start_with_options(
        fixture: &Fixture,
        environment: &str,
        disable_https: Option<&str>,
        tls: Option<&TlsFiles>,
    ) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let agent = match tls {
            Some(tls) => pinned_agent(&tls.der)?,
            None => ureq::agent(),
        };
        let scheme = if tls.is_some() { "https" } else { "http" };
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("{scheme}://{bind}");

            let mut command = Command::new(env!("CARGO_BIN_EXE_search-data-extractor"));
            command
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .arg("--environment")
                .arg(environment)
                .arg("--config")
                .arg(&fixture.config)
                .arg("--data-dir")
                .arg(&fixture.data_dir)
                .arg("--members")
                .arg(&fixture.members)
                .env("RUST_LOG", "warn")
                .env_remove("DISABLE_SEARCH_DATA_EXTRACTOR_HTTPS")
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            if let Some(value) = disable_https {
                command.env("DISABLE_SEARCH_DATA_EXTRACTOR_HTTPS", value);
            }
            if let Some(tls) = tls {
                command.arg("--tls-cert").arg(&tls.cert).arg("--tls-key").arg(&tls.key);
            }
            let mut child = command.spawn()?;

            match wait_for_server(&mut child, &agent, &base_url) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        agent,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn export_url(&self, query: &str) -> String {
        format!("{}{MOUNT}?{query}", self.base_url)
    }

    fn get_json(&self, query: &str, authorization: Option<&str>) -> TestResult<(u16, Value)> {
        self.get_json_with_headers(query, authorization, &[])
    }

    fn get_json_with_headers(
        &self,
        query: &str,
        authorization: Option<&str>,
        headers: &[(&str, &str)],
    ) -> TestResult<(u16, Value)> {
        let mut request = self.agent.get(&self.export_url(query));
        if let Some(value) = authorization {
            request = request.set("Authorization", value);
        }
        for (name, value) in headers {
            request = request.set(name, value);
        }
        match request.call() {
            Ok(resp) => {
                let status = resp.status();
                Ok((status, serde_json::from_str(&resp.into_string()?)?))
            }
            Err(ureq::Error::Status(code, resp)) => {
                Ok((code, serde_json::from_str(&resp.into_string()?)?))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

#[test]
fn dev_override_serves_paginated_export() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let server = TestServer::start(&fixture, "dev", Some("true"))?;
    let auth = basic("api-member", "api-member-pw");

    let (status, first) = server.get_json("class=Page", Some(&auth))?;
    assert_eq!(status, 200);
    assert_eq!(first["request"]["after"], "Page_0");
    assert_eq!(first["source"], "integration");
    let items = first["items"].as_array().ok_or("items array")?;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0], json!({"id": 1, "title": "One", "content": "first"}));
    assert_eq!(items[1]["title"], "Two");

    let (status, second) = server.get_json("class=Page&after=Page_2", Some(&auth))?;
    assert_eq!(status, 200);
    assert_eq!(second["request"]["after"], "Page_2");
    // id 3 is hidden and id 4 has no live stage.
    assert_eq!(second["items"], json!([]));
    Ok(())
}

#[test]
fn live_environment_ignores_override_and_requires_https() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let server = TestServer::start(&fixture, "live", Some("true"))?;
    let auth = basic("api-member", "api-member-pw");

    let (status, body) = server.get_json("class=Page", Some(&auth))?;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["message"], "Please use https");

    // Forwarded headers are ignored unless the proxy is trusted.
    let (status, body) =
        server.get_json_with_headers("class=Page", Some(&auth), &[("X-Forwarded-Proto", "https")])?;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["message"], "Please use https");
    Ok(())
}

#[test]
fn tls_listener_marks_requests_secure_in_live() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let tls_dir = tempfile::tempdir()?;
    let tls = TlsFiles::generate(tls_dir.path())?;
    let server = TestServer::start_tls(&fixture, "live", &tls)?;
    let auth = basic("api-member", "api-member-pw");

    let (status, body) = server.get_json("class=Page", Some(&auth))?;
    assert_eq!(status, 200);
    assert_eq!(body["request"]["after"], "Page_0");
    assert_eq!(body["items"].as_array().map(Vec::len), Some(2));

    let (status, body) = server.get_json("class=Page&class=Page&after=Page_1", Some(&auth))?;
    assert_eq!(status, 200);
    assert_eq!(body["request"]["after"], "Page_1");
    assert_eq!(body["items"], json!([{"id": 2, "title": "Two", "content": "second"}]));
    Ok(())
}

#[test]
fn authentication_failures_return_challenge() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let server = TestServer::start(&fixture, "dev", Some("1"))?;

    match server.agent.get(&server.export_url("class=Page")).call() {
        Ok(resp) => return Err(format!("expected 401, got {}", resp.status()).into()),
        Err(ureq::Error::Status(code, resp)) => {
            assert_eq!(code, 401);
            assert_eq!(
                resp.header("WWW-Authenticate"),
                Some("Basic realm=\"Search Data Extractor API\"")
            );
            let body: Value = serde_json::from_str(&resp.into_string()?)?;
            assert_eq!(body["error"]["message"], "Please enter a username and password.");
        }
        Err(err) => return Err(err.into()),
    }

    let wrong = basic("api-member", "wrong");
    let (status, body) = server.get_json("class=Page", Some(&wrong))?;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["message"], "That username / password isn't recognised");

    let author = basic("author", "author-pw");
    let (status, body) = server.get_json("class=Page", Some(&author))?;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["message"], "That user is not an administrator.");
    Ok(())
}

#[test]
fn class_checks_reject_missing_and_unexported_types() -> TestResult<()> {
    let fixture = Fixture::new()?;
    let server = TestServer::start(&fixture, "dev", Some("true"))?;
    let auth = basic("api-member", "api-member-pw");

    let (status, body) = server.get_json("after=Page_0", Some(&auth))?;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["message"], "Sorry you need to specify a class.");

    for class in ["Member", "NoSuchType"] {
        let (status, body) = server.get_json(&format!("class={class}"), Some(&auth))?;
        assert_eq!(status, 403);
        assert_eq!(body["error"]["message"], "Sorry that class is not valid.");
    }
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, agent: &ureq::Agent, base_url: &str) -> TestResult<()> {
    let url = format!("{base_url}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = agent.get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
