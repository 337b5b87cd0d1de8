use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use mitmlearn_transport::{
    ChannelTransport, Decision, HookAction, HookBridge, HubConfig, InterceptEvent,
    InterceptionHub, Listen, PhaseKind, Transport, Verdict,
};

fn start(gate_secs: f64) -> (InterceptionHub, ChannelTransport) {
    InterceptionHub::start(HubConfig {
        gate_timeout_secs: gate_secs,
    })
}

fn next_event(transport: &mut ChannelTransport, wait: Duration) -> Option<InterceptEvent> {
    match transport.listen(Some(wait)) {
        Listen::Payload(p) => Some(InterceptEvent::from_payload(&p).unwrap()),
        _ => None,
    }
}

fn decide(transport: &mut ChannelTransport, decision: Decision) {
    transport.send(&decision.to_payload().unwrap()).unwrap();
}

#[test_log::test]
fn test_gate_holds_new_requests_until_response() {
    let (hub, mut transport) = start(5.0);
    let point = hub.point("ep");

    let first = point.clone();
    let first_hook = thread::spawn(move || first.on_request("one", vec![], vec![]));
    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.msg, "one");
    decide(&mut transport, Decision::cmd("ep", Verdict::AllowReq));
    assert_eq!(first_hook.join().unwrap(), HookAction::Allow);

    // A new request arrives before the response to the first one.
    let second = point.clone();
    let second_hook = thread::spawn(move || second.on_request("two", vec![], vec![]));
    assert!(next_event(&mut transport, Duration::from_millis(200)).is_none());

    let responder = point.clone();
    let response_hook = thread::spawn(move || responder.on_response("reply", vec![], vec![]));
    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.kind, PhaseKind::Response);
    assert_eq!(event.msg, "reply");
    decide(&mut transport, Decision::cmd("ep", Verdict::AllowRes));
    assert_eq!(response_hook.join().unwrap(), HookAction::Allow);

    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.msg, "two");
    decide(&mut transport, Decision::cmd("ep", Verdict::KillReq));
    assert_eq!(second_hook.join().unwrap(), HookAction::Kill);
}

#[test_log::test]
fn test_gate_expires_when_response_never_comes() {
    let (hub, mut transport) = start(0.2);
    let point = hub.point("ep");

    let first = point.clone();
    let first_hook = thread::spawn(move || first.on_request("one", vec![], vec![]));
    next_event(&mut transport, Duration::from_secs(2)).unwrap();
    decide(&mut transport, Decision::cmd("ep", Verdict::AllowReq));
    first_hook.join().unwrap();

    let started = Instant::now();
    let second = point.clone();
    let second_hook = thread::spawn(move || second.on_request("two", vec![], vec![]));
    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.msg, "two");
    assert!(started.elapsed() >= Duration::from_millis(150));
    decide(&mut transport, Decision::cmd("ep", Verdict::AllowReq));
    assert_eq!(second_hook.join().unwrap(), HookAction::Allow);
}

#[test_log::test]
fn test_clear_flows_kills_current_and_queued_hooks() {
    let (hub, mut transport) = start(1.0);
    let point = hub.point("ep");

    let first = point.clone();
    let first_hook = thread::spawn(move || first.on_request("one", vec![], vec![]));
    next_event(&mut transport, Duration::from_secs(2)).unwrap();

    let queued = point.clone();
    let queued_hook = thread::spawn(move || queued.on_request("two", vec![], vec![]));
    thread::sleep(Duration::from_millis(100));

    decide(&mut transport, Decision::ClearFlows);
    assert_eq!(first_hook.join().unwrap(), HookAction::Kill);
    assert_eq!(queued_hook.join().unwrap(), HookAction::Kill);
    assert!(next_event(&mut transport, Duration::from_millis(100)).is_none());
}

#[test_log::test]
fn test_idle_clear_flows_is_not_replayed_to_next_hook() {
    let (hub, mut transport) = start(1.0);
    let point = hub.point("ep");

    decide(&mut transport, Decision::ClearFlows);
    thread::sleep(Duration::from_millis(100));

    let hook = thread::spawn(move || point.on_request("fresh", vec![], vec![]));
    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.msg, "fresh");
    decide(&mut transport, Decision::cmd("ep", Verdict::LowerGetReq));
    assert_eq!(hook.join().unwrap(), HookAction::LowerGet);
}

#[test_log::test]
fn test_two_points_are_tagged_by_name() {
    let (hub, mut transport) = start(1.0);
    let a = hub.point("client");
    let b = hub.point("server");

    let hook = thread::spawn(move || b.on_request("hello", vec![], vec![]));
    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.mitm, "server");
    decide(&mut transport, Decision::cmd("server", Verdict::KillReq));
    assert_eq!(hook.join().unwrap(), HookAction::Kill);
    assert_eq!(a.name(), "client");
}

#[test_log::test]
fn test_bridge_relays_hooks_over_tcp() {
    let (hub, mut transport) = start(1.0);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    HookBridge::new([hub.point("ep")]).spawn(listener);

    let proxy = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let event = InterceptEvent::request("ep", "hello").to_payload().unwrap();
        stream.write_all(format!("{event}\n").as_bytes()).unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).unwrap();
        serde_json::from_str::<HookAction>(&reply).unwrap()
    });

    let event = next_event(&mut transport, Duration::from_secs(2)).unwrap();
    assert_eq!(event.msg, "hello");
    decide(
        &mut transport,
        Decision::Cmd {
            mitm: "ep".into(),
            msg: Verdict::ReplaceReq,
            replacement: Some("fuzzed".into()),
            cookies: None,
        },
    );
    assert_eq!(
        proxy.join().unwrap(),
        HookAction::Replace {
            body: "fuzzed".into(),
            cookies: None
        }
    );
}
