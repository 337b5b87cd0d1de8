use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use mitmlearn_alphabet::{OutputSymbol, Query, Sentinel};
use mitmlearn_explore::{
    DriverConfig, DriverError, EncoderConfig, InteractionEncoder, NoSut, PointHandlers,
    SessionDriver,
};
use mitmlearn_fuzz::{registry, SymbolTable};
use mitmlearn_transport::message::ERROR_PAYLOAD;
use mitmlearn_transport::{
    channel_pair, ChannelPeer, ChannelTransport, Decision, InterceptEvent, Verdict,
};

/// Replies to the `n`th command with an optional raw payload.
type Script = Box<dyn Fn(usize, &Verdict) -> Option<String> + Send>;

fn payload(event: InterceptEvent) -> Option<String> {
    Some(event.to_payload().unwrap())
}

/// A client/server pair behind one interception point: every allowed
/// request is answered, every decided response triggers the next request.
/// Killed requests leave the session silent.
fn conversation(_n: usize, verdict: &Verdict) -> Option<String> {
    match verdict {
        Verdict::AllowReq | Verdict::ReplaceReq | Verdict::LowerGetReq => {
            payload(InterceptEvent::response("ep", "allow"))
        }
        Verdict::AllowRes | Verdict::ReplaceRes | Verdict::KillRes => {
            payload(InterceptEvent::request("ep", "allow"))
        }
        Verdict::KillReq => None,
    }
}

fn spawn_peer(peer: ChannelPeer, opening: InterceptEvent, script: Script) -> Receiver<Decision> {
    let (seen_tx, seen) = channel::unbounded();
    thread::spawn(move || {
        let _ = peer.to_engine.send(opening.to_payload().unwrap());
        let mut commands = 0;
        while let Ok(raw) = peer.from_engine.recv() {
            let decision = Decision::from_payload(&raw).unwrap();
            let next = match &decision {
                Decision::Cmd { msg, .. } => {
                    commands += 1;
                    script(commands, msg)
                }
                Decision::ClearFlows => None,
            };
            if seen_tx.send(decision).is_err() {
                break;
            }
            if let Some(raw) = next {
                let _ = peer.to_engine.send(raw);
            }
        }
    });
    seen
}

fn verdicts(seen: &Receiver<Decision>) -> Vec<Verdict> {
    seen.try_iter()
        .filter_map(|d| match d {
            Decision::Cmd { msg, .. } => Some(msg),
            Decision::ClearFlows => None,
        })
        .collect()
}

fn scripted(
    fuzzer: &str,
    early: bool,
    opening: InterceptEvent,
    script: Script,
) -> (InteractionEncoder<ChannelTransport>, Receiver<Decision>) {
    let (transport, peer) = channel_pair();
    let mut points = BTreeMap::new();
    points.insert(
        "ep".to_string(),
        PointHandlers {
            parser: registry::parser("string").unwrap(),
            fuzzer: registry::fuzzer(fuzzer).unwrap(),
        },
    );
    let config = EncoderConfig {
        mitm_timeout: Duration::from_millis(300),
        noflow_timeout: Duration::from_millis(400),
        early_termination: early,
    };
    let encoder =
        InteractionEncoder::new(transport, points, SymbolTable::in_memory().verbatim(), config)
            .unwrap();
    let seen = spawn_peer(peer, opening, script);
    (encoder, seen)
}

fn encoder(
    fuzzer: &str,
    early: bool,
) -> (InteractionEncoder<ChannelTransport>, Receiver<Decision>) {
    scripted(
        fuzzer,
        early,
        InterceptEvent::request("ep", "allow"),
        Box::new(conversation),
    )
}

#[test_log::test]
fn test_allow_round_trip_observes_both_halves() {
    let (mut encoder, _seen) = encoder("no_fuzz", false);
    encoder.reset().unwrap();
    let driver = SessionDriver::new(DriverConfig::default());
    let query: Query = "m-allow-rr;m-allow-rr".parse().unwrap();
    let outcome = driver.run(&query, &mut encoder, &mut NoSut).unwrap();
    assert_eq!(outcome.response.to_string(), "0-allow-allow;0-allow-allow");
    assert_eq!(outcome.transition_times.len(), 2);
}

#[test_log::test]
fn test_killed_request_is_noflow() {
    let (mut encoder, _seen) = encoder("no_fuzz", false);
    encoder.reset().unwrap();
    assert_eq!(
        encoder.process_action("killreq").unwrap(),
        OutputSymbol::Sentinel(Sentinel::NoFlow)
    );
}

#[test_log::test]
fn test_killres_lets_request_through_then_kills_response() {
    let (mut encoder, seen) = encoder("no_fuzz", false);
    encoder.reset().unwrap();
    assert_eq!(encoder.process_action("killres").unwrap().to_string(), "0-allow-allow");
    assert_eq!(verdicts(&seen), vec![Verdict::AllowReq, Verdict::KillRes]);
}

#[test_log::test]
fn test_spamres_replaces_response_and_nets_zero() {
    let (mut encoder, seen) = encoder("simple", false);
    encoder.reset().unwrap();
    assert_eq!(encoder.process_action("spamres").unwrap().to_string(), "0-allow-allow");
    let decisions: Vec<Decision> = seen.try_iter().collect();
    assert!(decisions.iter().any(|d| matches!(
        d,
        Decision::Cmd { msg: Verdict::ReplaceRes, replacement: Some(body), .. } if body == "spam"
    )));
    assert_eq!(encoder.digest(), "pending###spamres");
}

#[test_log::test]
fn test_not_applicable_fuzz_terminates_early() {
    let (mut encoder, _seen) = encoder("simple", true);
    encoder.reset().unwrap();
    // Nothing to replay on the first request of a session.
    assert_eq!(
        encoder.process_action("replayreq").unwrap(),
        OutputSymbol::Sentinel(Sentinel::Term)
    );
}

#[test_log::test]
fn test_empty_query_is_fatal() {
    let (mut encoder, _seen) = encoder("no_fuzz", false);
    let driver = SessionDriver::new(DriverConfig::default());
    let err = driver
        .run(&Query::new(Vec::new()), &mut encoder, &mut NoSut)
        .unwrap_err();
    assert!(matches!(err, DriverError::EmptyResponse));
}

#[test_log::test]
fn test_silent_client_after_response_is_null() {
    let (mut encoder, seen) = scripted(
        "no_fuzz",
        false,
        InterceptEvent::request("ep", "allow"),
        Box::new(|_: usize, verdict: &Verdict| match verdict {
            Verdict::AllowReq => payload(InterceptEvent::response("ep", "allow")),
            _ => None,
        }),
    );
    encoder.reset().unwrap();
    assert_eq!(encoder.process_action("allow").unwrap().to_string(), "0-allow-null");
    assert_eq!(verdicts(&seen), vec![Verdict::AllowReq, Verdict::AllowRes]);
}

#[test_log::test]
fn test_proxy_error_fills_the_response_half() {
    let (mut encoder, seen) = scripted(
        "no_fuzz",
        false,
        InterceptEvent::request("ep", "allow"),
        Box::new(|n: usize, _: &Verdict| match n {
            1 => Some(ERROR_PAYLOAD.to_string()),
            _ => payload(InterceptEvent::request("ep", "next")),
        }),
    );
    encoder.reset().unwrap();
    assert_eq!(
        encoder.process_action("allow").unwrap().to_string(),
        "0-proxyerror-next"
    );
    // After an error the pending message is treated as a request.
    assert_eq!(verdicts(&seen), vec![Verdict::AllowReq, Verdict::AllowReq]);
}

#[test_log::test]
fn test_undecodable_payload_is_msgerror() {
    let (mut encoder, seen) = scripted(
        "no_fuzz",
        false,
        InterceptEvent::request("ep", "allow"),
        Box::new(|_: usize, _: &Verdict| Some("not json".to_string())),
    );
    encoder.reset().unwrap();
    assert_eq!(
        encoder.process_action("allow").unwrap().to_string(),
        "0-msgerror-null"
    );
    assert_eq!(verdicts(&seen), vec![Verdict::AllowReq]);
}

#[test_log::test]
fn test_session_opening_with_a_response() {
    let (mut encoder, seen) = scripted(
        "no_fuzz",
        false,
        InterceptEvent::response("ep", "hello"),
        Box::new(conversation),
    );
    encoder.reset().unwrap();
    assert_eq!(encoder.process_action("allow").unwrap().to_string(), "0-null-allow");
    assert_eq!(verdicts(&seen), vec![Verdict::AllowRes]);
}
