use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use exectrace::{Event, Tracer, TracerConfig, pid_namespace};
use tracing::{error, info, warn};

/// Give up on the event stream after this many failed reads in a row.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// exectrace logs all exec calls on the system.
#[derive(Debug, Parser)]
#[command(name = "exectrace")]
struct Opt {
    /// Compiled BPF handler object to load into the kernel
    #[arg(short = 'b', long, env = "EXECTRACE_OBJECT")]
    object: PathBuf,

    /// Only trace processes in this PID namespace (see `readlink
    /// /proc/<pid>/ns/pid`) or its descendants, 0 traces everything
    #[arg(long, env = "EXECTRACE_PID_NS", default_value_t = 0)]
    pid_ns: u32,

    /// Only trace processes in our own PID namespace or its descendants
    #[arg(long, conflicts_with = "pid_ns")]
    local_pid_ns: bool,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::parse();

    let pid_ns = if opt.local_pid_ns {
        pid_namespace().context("get current pidns")?
    } else {
        opt.pid_ns
    };

    let image = std::fs::read(&opt.object)
        .with_context(|| format!("read BPF object {}", opt.object.display()))?;
    let tracer = Arc::new(
        Tracer::new(&image, TracerConfig::new().with_pid_ns(pid_ns)).context("create tracer")?,
    );

    // When we get a SIGINT or SIGTERM we close the tracer so the loop exits.
    let closer = tracer.clone();
    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            error!("failed to listen for shutdown signals: {err}");
            return;
        }
        warn!("signal received, closing tracer");
        if let Err(err) = closer.close() {
            if !err.is_already_closed() {
                error!("error closing tracer: {err}");
            }
        }
    });

    info!("Waiting for events..");
    let mut failures = 0;
    loop {
        let event = match tracer.read().await {
            Ok(event) => {
                failures = 0;
                event
            }
            Err(err) if err.is_closed() => break,
            Err(err) => {
                failures += 1;
                warn!(attempt = failures, "failed to read event from tracer: {err}");
                if failures == MAX_CONSECUTIVE_FAILURES {
                    error!(attempts = failures, "failed to read event after many attempts");
                    let _ = tracer.close();
                    return Err(err).context("read events");
                }
                continue;
            }
        };

        match opt.output {
            OutputFormat::Text => println!("{}", render_text(&event)),
            OutputFormat::Json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("error writing event as JSON: {err}"),
            },
        }
    }

    match tracer.close() {
        Err(err) if !err.is_already_closed() => Err(err).context("close tracer"),
        _ => {
            info!("Exiting...");
            Ok(())
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

fn render_text(event: &Event) -> String {
    // Decoded arguments never contain NUL, the only input shlex refuses.
    let argv = shlex::try_join(event.argv.iter().map(String::as_str))
        .unwrap_or_else(|_| format!("{:?}", event.argv));
    let ellipsis = if event.truncated { "..." } else { "" };
    format!(
        "[pid={}, uid={}, gid={}, comm={:?}] {}{}",
        event.pid, event.uid, event.gid, event.comm, argv, ellipsis
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(argv: &[&str], truncated: bool) -> Event {
        Event {
            filename: "/bin/sh".to_string(),
            argv: argv.iter().map(|a| a.to_string()).collect(),
            truncated,
            pid: 12,
            uid: 1000,
            gid: 2000,
            comm: "bash".to_string(),
            cgroup: None,
        }
    }

    /// The argv part of a text line, split back the way a shell would.
    fn shell_split(line: &str) -> Vec<String> {
        let (_, argv) = line.split_once("] ").unwrap();
        shlex::split(argv).unwrap()
    }

    #[test]
    fn text_output() {
        assert_eq!(
            render_text(&event(&["/usr/bin/env", "-i", "true"], false)),
            r#"[pid=12, uid=1000, gid=2000, comm="bash"] /usr/bin/env -i true"#
        );

        let argv = ["sh", "-c", "# hello world", "it's", "$HOME", ""];
        let line = render_text(&event(&argv, false));
        assert!(line.starts_with(r#"[pid=12, uid=1000, gid=2000, comm="bash"] sh -c "#), "{line}");
        assert_eq!(shell_split(&line), argv);
    }

    #[test]
    fn text_output_marks_truncation() {
        let line = render_text(&event(&["echo", "a b"], true));
        let quoted = line.strip_suffix("...").expect("missing truncation marker");
        assert_eq!(shell_split(quoted), ["echo", "a b"]);
        assert!(!render_text(&event(&["echo"], false)).ends_with("..."));
    }

    #[test]
    fn cli_args() {
        let opt = Opt::try_parse_from(["exectrace", "-b", "handler.o", "--pid-ns", "42", "-f", "json"])
            .unwrap();
        assert_eq!(opt.object, PathBuf::from("handler.o"));
        assert_eq!(opt.pid_ns, 42);
        assert_eq!(opt.output, OutputFormat::Json);

        assert!(
            Opt::try_parse_from(["exectrace", "-b", "x.o", "--pid-ns", "1", "--local-pid-ns"])
                .is_err()
        );
    }
}
