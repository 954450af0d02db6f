//! Purpose: `search-data-extractor` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: The HTTPS override env flag is read here and only honored in dev.
use std::io::{self, IsTerminal, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum, ValueHint};
use serde_json::{Map, Value, json};

mod serve;

use search_data_extractor::api::{
    ENV_DISABLE_HTTPS, Environment, Error, ErrorKind, ExportRequest, Exporter, Member,
    NOT_PERMITTED_MESSAGE, PERMISSIONS, env_flag_is_set, generate_salt, hash_password,
    to_exit_code,
};
use search_data_extractor::config::{ExtractorConfig, load_members};
use search_data_extractor::data_dir::load_store;

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let config = serve_config_from_args(args)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config))
        }
        Command::Export(args) => run_export(args),
        Command::HashPassword(args) => run_hash_password(args),
        Command::Permissions => {
            let permissions: Vec<Value> = PERMISSIONS
                .iter()
                .map(|(code, description)| json!({ "code": code, "description": description }))
                .collect();
            emit_json(&json!({ "permissions": permissions }))
        }
    }
}

#[derive(Parser)]
#[command(
    name = "search-data-extractor",
    version,
    about = "Authenticated, paginated JSON export of published records for search indexing",
    after_help = r#"EXAMPLES
  $ search-data-extractor serve --data-dir ./data --members ./members.json --tls-self-signed
  $ search-data-extractor export --data-dir ./data --members ./members.json --member api-member --class Page
  $ echo 'secret' | search-data-extractor hash-password --username api-member --permission SEARCH_DATA_EXTRACTOR_ACCESS"#
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Serve the export endpoint over HTTP(S)",
        after_long_help = r#"NOTES
  - Requests must arrive over TLS, or through a trusted proxy (--trust-forwarded-proto)
  - In --environment dev, DISABLE_SEARCH_DATA_EXTRACTOR_HTTPS=true skips the https check
  - Clients authenticate with HTTP Basic; members need SEARCH_DATA_EXTRACTOR_ACCESS (or ADMIN)
  - Loopback is the default; non-loopback binds require --allow-non-loopback"#
    )]
    Serve(ServeArgs),
    #[command(about = "Print one export page for a member without going through HTTP")]
    Export(ExportArgs),
    #[command(about = "Read a password from stdin and print a members-file entry")]
    HashPassword(HashPasswordArgs),
    #[command(about = "List the permission codes this service defines")]
    Permissions,
}

#[derive(clap::Args)]
struct SourceArgs {
    #[arg(long, value_name = "PATH", help = "Extractor config (JSON)", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Directory of <Type>.json record files", value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,
    #[arg(long, value_name = "PATH", help = "Members file (JSON)", value_hint = ValueHint::FilePath)]
    members: PathBuf,
}

#[derive(clap::Args)]
struct ServeArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(
        long,
        default_value = "127.0.0.1:8443",
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        default_value = serve::DEFAULT_MOUNT,
        help = "Route path of the export endpoint",
        help_heading = "Connection"
    )]
    mount: String,
    #[arg(
        long,
        value_enum,
        default_value = "live",
        help = "Deployment environment: dev|test|live",
        help_heading = "Connection"
    )]
    environment: EnvironmentCli,
    #[arg(long, value_name = "PATH", help = "TLS certificate path (PEM)", value_hint = ValueHint::FilePath, help_heading = "TLS")]
    tls_cert: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "TLS key path (PEM)", value_hint = ValueHint::FilePath, help_heading = "TLS")]
    tls_key: Option<PathBuf>,
    #[arg(
        long,
        help = "Generate a self-signed TLS cert for this run",
        help_heading = "TLS"
    )]
    tls_self_signed: bool,
    #[arg(
        long,
        help = "Treat X-Forwarded-Proto: https as a secure request (behind a TLS proxy)",
        help_heading = "TLS"
    )]
    trust_forwarded_proto: bool,
    #[arg(
        long,
        help = "Allow non-loopback binds",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
}

#[derive(clap::Args)]
struct ExportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, help = "Member whose visibility applies")]
    member: String,
    #[arg(long, help = "Record type to export")]
    class: String,
    #[arg(long, help = "Cursor of the form <class>_<id>")]
    after: Option<String>,
}

#[derive(clap::Args)]
struct HashPasswordArgs {
    #[arg(long)]
    username: String,
    #[arg(long = "permission", value_name = "CODE", help = "Permission code (repeatable)")]
    permissions: Vec<String>,
    #[arg(long = "group", value_name = "GROUP", help = "Group code (repeatable)")]
    groups: Vec<String>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EnvironmentCli {
    Dev,
    Test,
    Live,
}

impl From<EnvironmentCli> for Environment {
    fn from(value: EnvironmentCli) -> Self {
        match value {
            EnvironmentCli::Dev => Environment::Dev,
            EnvironmentCli::Test => Environment::Test,
            EnvironmentCli::Live => Environment::Live,
        }
    }
}

fn serve_config_from_args(args: ServeArgs) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:8443.")
    })?;
    let https_override = env_flag_is_set(std::env::var(ENV_DISABLE_HTTPS).ok().as_deref());
    Ok(serve::ServeConfig {
        bind,
        mount: args.mount,
        environment: args.environment.into(),
        https_override,
        trust_forwarded_proto: args.trust_forwarded_proto,
        allow_non_loopback: args.allow_non_loopback,
        config_path: args.source.config,
        data_dir: args.source.data_dir,
        members_path: args.source.members,
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
        tls_self_signed: args.tls_self_signed,
    })
}

fn run_export(args: ExportArgs) -> Result<(), Error> {
    let extractor = match &args.source.config {
        Some(path) => ExtractorConfig::load(path)?,
        None => ExtractorConfig::default(),
    };
    let members = load_members(&args.source.members)?;
    let Some(member) = members.get(&args.member) else {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("unknown member {}", args.member))
            .with_path(&args.source.members));
    };
    let identity = member.identity();
    if !identity.has_permission(&extractor.permission_code) {
        return Err(Error::new(ErrorKind::Unauthenticated)
            .with_message(NOT_PERMITTED_MESSAGE)
            .with_hint(format!("Grant {} to the member.", extractor.permission_code)));
    }

    let store = load_store(&args.source.data_dir)?;
    let registry = extractor.build_registry()?;
    let mut exporter = Exporter::new(Arc::new(store), Arc::new(registry), extractor.settings())?;
    if let Some(hook) = extractor.metadata_hook() {
        exporter = exporter.with_hook(hook);
    }
    let request = ExportRequest {
        class: Some(args.class),
        after: args.after,
    };
    let envelope = exporter.export(&request, &identity)?;
    let value = serde_json::to_value(&envelope).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode envelope")
            .with_source(err)
    })?;
    emit_json(&value)
}

fn run_hash_password(args: HashPasswordArgs) -> Result<(), Error> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read password from stdin")
            .with_source(err)
    })?;
    let password = input.lines().next().unwrap_or_default();
    if password.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("password must not be empty")
            .with_hint("Pipe the password on stdin, e.g. `echo secret | search-data-extractor hash-password ...`."));
    }
    let salt = generate_salt()?;
    let member = Member {
        username: args.username,
        password_sha256: hash_password(&salt, password),
        salt,
        permissions: args.permissions,
        groups: args.groups,
    };
    let value = serde_json::to_value(&member).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode member")
            .with_source(err)
    })?;
    emit_json(&value)
}

fn emit_json(value: &Value) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode json")
            .with_source(err)
    })?;
    println!("{text}");
    Ok(())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::InsecureTransport => "insecure transport".to_string(),
        ErrorKind::Unauthenticated => "not authenticated".to_string(),
        ErrorKind::MissingClass => "missing class".to_string(),
        ErrorKind::ClassNotAllowed => "class not allowed".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = std::error::Error::source(err);
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
