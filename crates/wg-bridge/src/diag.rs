//! SIGUSR2 thread dump
//!
//! Sending SIGUSR2 to the app process logs every thread (id, name, state,
//! kernel wait channel) and the live tunnel handles at error level under
//! `<log_tag>/Stacktrace`. The watcher is a single-threaded tokio runtime
//! parked on the signal stream for the life of the process.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::signal::unix::{SignalKind, signal};

use crate::logging::{LogLevel, LogSink};
use crate::registry::Handle;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the process-wide watcher.
///
/// Returns `Ok(false)` if one is already running.
pub fn install<F>(sink: Arc<dyn LogSink>, tag: &str, snapshot: F) -> io::Result<bool>
where
    F: Fn() -> Vec<Handle> + Send + 'static,
{
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(false);
    }

    match spawn_watcher(sink, format!("{tag}/Stacktrace"), snapshot) {
        Ok(()) => Ok(true),
        Err(e) => {
            INSTALLED.store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}

fn spawn_watcher<F>(sink: Arc<dyn LogSink>, tag: String, snapshot: F) -> io::Result<()>
where
    F: Fn() -> Vec<Handle> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    // Registration must happen inside the runtime, before the thread starts,
    // so the handler is in place once install returns.
    let mut signals = {
        let _guard = runtime.enter();
        signal(SignalKind::user_defined2())?
    };

    thread::Builder::new()
        .name("wg-stackdump".into())
        .spawn(move || {
            runtime.block_on(async move {
                while signals.recv().await.is_some() {
                    for line in report(&snapshot()).lines() {
                        sink.write(LogLevel::Error, &tag, line);
                    }
                }
            });
        })?;

    tracing::debug!("SIGUSR2 stack dump installed");
    Ok(())
}

/// Text of one dump.
pub fn report(handles: &[Handle]) -> String {
    let handles: Vec<String> = handles.iter().map(Handle::to_string).collect();
    let mut out = format!("Live tunnel handles: [{}]\n", handles.join(", "));

    match task_lines(Path::new("/proc/self/task")) {
        Ok(lines) => {
            for line in lines {
                out.push_str(&line);
                out.push('\n');
            }
        }
        Err(e) => out.push_str(&format!("Thread list unavailable: {e}\n")),
    }
    out
}

fn task_lines(tasks: &Path) -> io::Result<Vec<String>> {
    let mut tids: Vec<u32> = fs::read_dir(tasks)?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    tids.sort_unstable();

    Ok(tids
        .into_iter()
        .map(|tid| {
            let dir = tasks.join(tid.to_string());
            let name = read_trimmed(&dir.join("comm")).unwrap_or_else(|| "?".into());
            let state = fs::read_to_string(dir.join("stat"))
                .ok()
                .and_then(|stat| parse_state(&stat))
                .unwrap_or('?');
            let wchan = read_trimmed(&dir.join("wchan"))
                .filter(|w| !w.is_empty() && w != "0")
                .unwrap_or_else(|| "-".into());
            format!("thread {tid} \"{name}\" state={state} wchan={wchan}")
        })
        .collect())
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// State letter from `/proc/<pid>/stat`. The name field may itself contain
/// parentheses, so look after the last one.
fn parse_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("42 (wg-stack) S 1 42 42 0"), Some('S'));
        assert_eq!(parse_state("7 (a) (b)) R 1"), Some('R'));
        assert_eq!(parse_state("garbage"), None);
    }

    #[test]
    fn test_report_lists_handles() {
        let handles = [Handle::new(0).unwrap(), Handle::new(3).unwrap()];
        let report = report(&handles);
        assert!(report.starts_with("Live tunnel handles: [0, 3]\n"));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_report_includes_named_threads() {
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let sample = thread::Builder::new()
            .name("diag-sample".into())
            .spawn(move || {
                started_tx.send(()).unwrap();
                let _ = stop_rx.recv();
            })
            .unwrap();

        // The name is applied before the body runs
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let report = report(&[]);
        stop_tx.send(()).unwrap();
        sample.join().unwrap();

        assert!(report.contains("\"diag-sample\""), "{report}");
    }

    #[derive(Default)]
    struct MemorySink {
        lines: Mutex<Vec<(String, String)>>,
    }

    impl LogSink for MemorySink {
        fn write(&self, _level: LogLevel, tag: &str, message: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((tag.to_string(), message.to_string()));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_sigusr2_logs_dump() {
        let sink = Arc::new(MemorySink::default());
        assert!(install(sink.clone(), "WireGuard/GoBackend", || vec![Handle::new(5).unwrap()]).unwrap());
        assert!(!install(sink.clone(), "WireGuard/GoBackend", Vec::new).unwrap());

        unsafe {
            libc::raise(libc::SIGUSR2);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = sink.lines.lock().unwrap().iter().any(|(tag, line)| {
                tag == "WireGuard/GoBackend/Stacktrace" && line == "Live tunnel handles: [5]"
            });
            if found {
                break;
            }
            assert!(Instant::now() < deadline, "no dump logged");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
