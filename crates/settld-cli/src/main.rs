// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The `settld` CLI.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use settld_cli::{load_trust, verify_path, EXIT_USAGE, EXIT_VERIFY_FAILED};
use settld_conformance::{run_pack, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "settld", version, about = "Verifiable settlement substrate CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Human-readable summary.
    Text,
    /// `VerifyCliOutput.v1` JSON.
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify a bundle ZIP or a sealed JSON artifact offline.
    Verify {
        /// Path to the target file.
        path: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Trust file (role → name → public key PEM) for signed targets.
        #[arg(long)]
        trust: Option<PathBuf>,
    },

    /// Run a conformance pack.
    Conformance {
        /// Pack directory containing cases.json and fixtures.
        #[arg(long)]
        pack: PathBuf,

        /// Fail closed if the emitted report/cert pair drifts.
        #[arg(long)]
        strict_artifacts: bool,

        /// Write the run report JSON here.
        #[arg(long)]
        json_out: Option<PathBuf>,

        /// Write the cert bundle JSON here.
        #[arg(long)]
        cert_bundle_out: Option<PathBuf>,
    },

    /// Generate an Ed25519 keypair as PEM files.
    Keygen {
        /// Output directory (defaults to the current directory).
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Verify { path, format, trust } => cmd_verify(&path, format, trust.as_deref()),
        Commands::Conformance {
            pack,
            strict_artifacts,
            json_out,
            cert_bundle_out,
        } => cmd_conformance(
            &pack,
            strict_artifacts,
            json_out.as_deref(),
            cert_bundle_out.as_deref(),
        ),
        Commands::Keygen { out } => cmd_keygen(&out),
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn cmd_verify(
    path: &std::path::Path,
    format: OutputFormat,
    trust_path: Option<&std::path::Path>,
) -> i32 {
    let trust = match trust_path.map(load_trust).transpose() {
        Ok(trust) => trust,
        Err(message) => {
            eprintln!("error: {message}");
            return EXIT_USAGE;
        }
    };
    let outcome = match verify_path(path, trust.as_ref()) {
        Ok(outcome) => outcome,
        Err(message) => {
            eprintln!("error: {message}");
            return EXIT_USAGE;
        }
    };
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome.to_cli_output(path))
                    .unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Text => {
            if outcome.report.ok {
                println!("ok: {} verified", path.display());
            } else {
                println!("FAILED: {}", path.display());
                for issue in &outcome.report.errors {
                    println!("  [{}] {}: {}", issue.code, issue.path, issue.message);
                }
            }
            for issue in &outcome.report.warnings {
                println!("  warning [{}] {}: {}", issue.code, issue.path, issue.message);
            }
        }
    }
    outcome.exit_code()
}

fn cmd_conformance(
    pack: &std::path::Path,
    strict_artifacts: bool,
    json_out: Option<&std::path::Path>,
    cert_bundle_out: Option<&std::path::Path>,
) -> i32 {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let options = RunOptions {
        strict_artifacts,
        budget: None,
    };
    let run = match run_pack(pack, &options, &now) {
        Ok(run) => run,
        Err(settld_conformance::runner::RunError::StrictValidation { report }) => {
            eprintln!("strict-artifact validation failed: {report:?}");
            return EXIT_VERIFY_FAILED;
        }
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USAGE;
        }
    };

    for out in [(json_out, &run.report), (cert_bundle_out, &run.cert_bundle)] {
        if let (Some(path), artifact) = out {
            let rendered = serde_json::to_string_pretty(artifact).unwrap_or_default();
            if let Err(e) = std::fs::write(path, rendered) {
                eprintln!("error: cannot write {}: {e}", path.display());
                return EXIT_USAGE;
            }
        }
    }

    let failed = run.results.iter().filter(|r| !r.pass).count();
    println!(
        "{} cases, {} passed, {failed} failed",
        run.results.len(),
        run.results.len() - failed
    );
    for result in run.results.iter().filter(|r| !r.pass) {
        println!("  FAILED {}: expected {:?}, got {:?}", result.id, result.expected, result.actual);
    }
    if failed == 0 { 0 } else { EXIT_VERIFY_FAILED }
}

fn cmd_keygen(out: &std::path::Path) -> i32 {
    let keypair = match settld_crypto::Keypair::generate() {
        Ok(keypair) => keypair,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USAGE;
        }
    };
    let private = match keypair.private_key_pem() {
        Ok(pem) => pem,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USAGE;
        }
    };
    let public_path = out.join("settld_signer.pub.pem");
    let private_path = out.join("settld_signer.pem");
    if let Err(e) = std::fs::write(&public_path, keypair.public_key_pem())
        .and_then(|()| std::fs::write(&private_path, private))
    {
        eprintln!("error: cannot write key files: {e}");
        return EXIT_USAGE;
    }
    println!("keyId: {}", keypair.key_id());
    println!("public: {}", public_path.display());
    println!("private: {}", private_path.display());
    0
}
