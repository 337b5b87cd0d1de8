//! TCP front for interception points, for proxies running in another
//! process.
//!
//! The proxy addon opens a connection and writes one [`InterceptEvent`]
//! per line. Each line is answered with one [`HookAction`] line once the
//! engine has decided. Connections are served on their own threads, so
//! concurrent hooks reach the hub in parallel and are serialized there.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::hub::{HookAction, InterceptionPoint};
use crate::message::{InterceptEvent, PhaseKind};

pub struct HookBridge {
    points: Arc<BTreeMap<String, InterceptionPoint>>,
}

impl HookBridge {
    pub fn new(points: impl IntoIterator<Item = InterceptionPoint>) -> Self {
        let points = points
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            points: Arc::new(points),
        }
    }

    /// Accept proxy connections on `listener` until it fails.
    pub fn spawn(self, listener: TcpListener) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "hook bridge listening");
            }
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "hook bridge accept failed");
                        continue;
                    }
                };
                let points = Arc::clone(&self.points);
                thread::spawn(move || {
                    if let Err(e) = serve_connection(stream, &points) {
                        debug!(error = %e, "hook connection closed");
                    }
                });
            }
        })
    }
}

fn serve_connection(
    stream: TcpStream,
    points: &BTreeMap<String, InterceptionPoint>,
) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let action = dispatch(&line, points);
        serde_json::to_writer(&mut writer, &action)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    Ok(())
}

fn dispatch(line: &str, points: &BTreeMap<String, InterceptionPoint>) -> HookAction {
    let event = match InterceptEvent::from_payload(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "undecodable hook event, allowing");
            return HookAction::Allow;
        }
    };
    let Some(point) = points.get(&event.mitm) else {
        warn!(mitm = %event.mitm, "hook from unknown interception point, allowing");
        return HookAction::Allow;
    };
    match event.kind {
        PhaseKind::Request => point.on_request(&event.msg, event.cookies, event.headers),
        PhaseKind::Response => point.on_response(&event.msg, event.cookies, event.headers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_action_wire_format() {
        assert_eq!(
            serde_json::to_string(&HookAction::Allow).unwrap(),
            r#"{"action":"allow"}"#
        );
        assert_eq!(
            serde_json::to_string(&HookAction::LowerGet).unwrap(),
            r#"{"action":"lower_get"}"#
        );
        let replace: HookAction =
            serde_json::from_str(r#"{"action":"replace","body":"x"}"#).unwrap();
        assert_eq!(
            replace,
            HookAction::Replace {
                body: "x".into(),
                cookies: None
            }
        );
    }

    #[test]
    fn test_unknown_point_is_allowed() {
        let points = BTreeMap::new();
        let line = InterceptEvent::request("nowhere", "m").to_payload().unwrap();
        assert_eq!(dispatch(&line, &points), HookAction::Allow);
        assert_eq!(dispatch("not json", &points), HookAction::Allow);
    }
}
