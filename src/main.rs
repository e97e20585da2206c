//! `fluux-connect`: connect, secure and authenticate one XMPP account, then
//! report what was negotiated.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fluux_security::security_layer::pin_on_approval;
use fluux_security::sasl::PasswordProvider;
use fluux_security::transport::{ExtraInfo, ExtraInfoKey};
use fluux_security::verify::{ApprovalHook, PinStore, PinType};
use fluux_security::{connect_jid, ConnectError, Jid, MakeOptions, PinSource, SecurityLayer};
use futures_util::FutureExt;
use tracing::{error, info, warn};

const DEFAULT_PASSWORD_ENV: &str = "FLUUX_PASSWORD";

struct Options {
    jid: Jid,
    server: Option<String>,
    password_env: String,
    pin_store: Option<PathBuf>,
    trust_on_first_use: bool,
    anonymous: Option<String>,
    dangerous_insecure_tls: bool,
    allow_plaintext: bool,
}

fn print_help() {
    eprintln!("fluux-connect v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-connect --jid=USER@DOMAIN [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --jid=JID             Account to authenticate as");
    eprintln!("      --server=SERVER       tls://host:port, tcp://host:port[?domain=d] or host:port");
    eprintln!("                            (default: SRV lookup of the JID's domain)");
    eprintln!("      --password-env=VAR    Read the password from VAR (default: {DEFAULT_PASSWORD_ENV})");
    eprintln!("      --pin-store[=PATH]    Accept certificates pinned in PATH");
    eprintln!("      --trust-on-first-use  Pin certificates that fail verification instead of rejecting them");
    eprintln!("      --anonymous[=TRACE]   Try SASL ANONYMOUS first");
    eprintln!("      --allow-plaintext     Continue without TLS if the server does not offer it");
    eprintln!("      --dangerous-insecure-tls");
    eprintln!("                            Disable TLS certificate verification (INSECURE!)");
    eprintln!("  -v, --verbose             Log to stderr");
    eprintln!("      --verbose=xmpp        Log to stderr, including negotiation elements");
    eprintln!("      --log-file=PATH       Also write a daily-rotating log next to PATH");
    eprintln!("  -h, --help                Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG                  Override log filter (e.g. RUST_LOG=debug)");
}

fn default_pin_store() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("com.processone.fluux")
        .join("pins.json")
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter().find_map(|arg| arg.strip_prefix(name)?.strip_prefix('='))
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|arg| arg == name)
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let jid = flag_value(args, "--jid")
        .ok_or_else(|| "--jid=JID is required".to_string())?
        .parse::<Jid>()
        .map_err(|e| format!("invalid --jid: {e}"))?;

    let trust_on_first_use = has_flag(args, "--trust-on-first-use");
    let pin_store = match flag_value(args, "--pin-store") {
        Some(path) => Some(PathBuf::from(path)),
        None if has_flag(args, "--pin-store") || trust_on_first_use => Some(default_pin_store()),
        None => None,
    };
    let anonymous = match flag_value(args, "--anonymous") {
        Some(trace) => Some(trace.to_string()),
        None if has_flag(args, "--anonymous") => Some(String::new()),
        None => None,
    };

    Ok(Options {
        jid,
        server: flag_value(args, "--server").map(str::to_string),
        password_env: flag_value(args, "--password-env")
            .unwrap_or(DEFAULT_PASSWORD_ENV)
            .to_string(),
        pin_store,
        trust_on_first_use,
        anonymous,
        dangerous_insecure_tls: has_flag(args, "--dangerous-insecure-tls"),
        allow_plaintext: has_flag(args, "--allow-plaintext"),
    })
}

fn init_logging(verbose_level: Option<&str>, log_file_path: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let filter = || {
        if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_security=info,fluux_security::stream::xmpp=debug,info")
        } else {
            EnvFilter::new("fluux_security=info,info")
        }
    };

    let file_layer = log_file_path.map(|path| {
        let path = PathBuf::from(path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fluux-connect.log".to_string());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            eprintln!("Warning: could not create log directory '{}': {}", dir.display(), e);
        }
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, name));
        // The writer thread must outlive every log call.
        std::mem::forget(guard);
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(filter())
    });

    let stderr_layer = (verbose_level.is_some() || rust_log).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter())
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

fn password_from_env(var: String) -> PasswordProvider {
    Arc::new(move |jid: Jid, _attempt: u32| {
        let var = var.clone();
        async move {
            match std::env::var(&var) {
                Ok(password) => Some(password),
                Err(_) => {
                    warn!(jid = %jid, var = %var, "No password in environment");
                    None
                }
            }
        }
        .boxed()
    })
}

fn build_layer(options: &Options) -> Result<SecurityLayer, ConnectError> {
    let mut pin_source = None;
    let mut approval: Option<ApprovalHook> = None;
    if let Some(path) = &options.pin_store {
        let store = PinStore::load(path, PinType::PublicKey)
            .map_err(|e| ConnectError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), empty = store.is_empty(), "Using pin store");
        let store = Arc::new(RwLock::new(store));
        if options.trust_on_first_use {
            let path = path.clone();
            approval = Some(pin_on_approval(store.clone(), move |store: &PinStore| {
                if let Err(e) = store.save(&path) {
                    error!(path = %path.display(), error = %e, "Could not save pin store");
                }
            }));
        }
        pin_source = Some(PinSource::Store(store));
    }

    let password_provider = (options.anonymous.is_none()
        || std::env::var(&options.password_env).is_ok())
    .then(|| password_from_env(options.password_env.clone()));

    SecurityLayer::make(MakeOptions {
        password_provider,
        pin_store: pin_source,
        post_handshake_deferred_failure: approval,
        anonymous: options.anonymous.clone(),
        no_verify: options.dangerous_insecure_tls,
        tls_required: !options.allow_plaintext,
        // The environment cannot produce a different password on retry.
        max_auth_attempts: 1,
        ..Default::default()
    })
}

async fn run(options: Options) -> Result<(), ConnectError> {
    let layer = build_layer(&options)?;
    let mut connected = connect_jid(&options.jid, &layer, options.server.as_deref()).await?;

    let transport = connected.stream.transport();
    let session = match transport.get_extra_info(ExtraInfoKey::TlsConnectionHandle) {
        Some(ExtraInfo::TlsSession(session)) => format!(
            "{} {}",
            session.protocol_version.as_deref().unwrap_or("?"),
            session.cipher_suite.as_deref().unwrap_or("?")
        ),
        _ => "none (plaintext)".to_string(),
    };
    println!("Connected to {}:{}", connected.endpoint.host, connected.endpoint.port);
    println!("TLS: {session}");
    println!("Authenticated as {}", options.jid);
    println!("Features: {}", connected.features.raw);

    connected.stream.close().await;
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        print_help();
        std::process::exit(0);
    }

    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    init_logging(verbose_level, flag_value(&args, "--log-file"));

    let options = match parse_options(&args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Try --help.");
            std::process::exit(2);
        }
    };
    if options.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: could not start the async runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(options)) {
        error!(error = %e, "Connection failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
