//! Peer session negotiation without a relay
//!
//! Descriptions and candidates are handed between two sessions directly so
//! ordering can be controlled precisely.

use campuscare_webrtc::signaling::IceCandidate;
use campuscare_webrtc::testing::SimulatedEngineFactory;
use campuscare_webrtc::{
    CallRole, ConnectionState, Error, MediaAcquisition, PeerEvent, PeerSession, Result,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,campuscare_webrtc=debug")
        .with_test_writer()
        .try_init();
}

fn host_candidate(foundation: u32, port: u16) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{} 1 udp 2130706431 10.0.0.5 {} typ host", foundation, port),
        Some("0".to_string()),
        Some(0),
    )
}

/// Forward candidates both ways until both sessions report `target`
async fn exchange_until(
    a: &PeerSession,
    a_events: &mut UnboundedReceiver<PeerEvent>,
    b: &PeerSession,
    b_events: &mut UnboundedReceiver<PeerEvent>,
    target: ConnectionState,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.state() != target || b.state() != target {
        tokio::select! {
            Some(event) = a_events.recv() => {
                if let PeerEvent::LocalCandidate(c) = event {
                    b.add_remote_candidate(c).await?;
                }
            }
            Some(event) = b_events.recv() => {
                if let PeerEvent::LocalCandidate(c) = event {
                    a.add_remote_candidate(c).await?;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                panic!("sessions stuck at {} / {}", a.state(), b.state());
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_offer_answer_round_trip_connects() -> Result<()> {
    init_test_tracing();
    let factory = SimulatedEngineFactory::new();
    let (caller, mut caller_events) = PeerSession::new("call-1".to_string(), &factory).await?;
    let (callee, mut callee_events) = PeerSession::new("call-1".to_string(), &factory).await?;

    let caller_media = MediaAcquisition::synthetic();
    let callee_media = MediaAcquisition::synthetic();
    caller.attach_local_stream(caller_media.acquire(true, true).await?).await?;
    callee.attach_local_stream(callee_media.acquire(false, true).await?).await?;

    let offer = caller.create_offer().await?;
    assert!(offer.sdp.contains("m=audio"));
    assert!(offer.sdp.contains("m=video"));

    let answer = callee.accept_offer(offer).await?;
    caller.accept_answer(answer).await?;
    assert_eq!(caller.role(), Some(CallRole::Caller));
    assert_eq!(callee.role(), Some(CallRole::Callee));

    exchange_until(
        &caller,
        &mut caller_events,
        &callee,
        &mut callee_events,
        ConnectionState::Connected,
    )
    .await?;

    assert_eq!(caller.remote_stream().track_count(), 1);
    assert_eq!(callee.remote_stream().track_count(), 2);

    caller.close().await;
    callee.close().await;
    assert!(!caller_media.is_busy());
    assert!(!callee_media.is_busy());
    Ok(())
}

#[tokio::test]
async fn test_early_candidates_applied_exactly_once() -> Result<()> {
    init_test_tracing();
    let caller_factory = SimulatedEngineFactory::new();
    let callee_factory = SimulatedEngineFactory::new();
    let (caller, _caller_events) = PeerSession::new("call-2".to_string(), &caller_factory).await?;
    let (callee, _callee_events) = PeerSession::new("call-2".to_string(), &callee_factory).await?;

    // Candidates overtake the offer, one of them twice
    callee.add_remote_candidate(host_candidate(1, 50000)).await?;
    callee.add_remote_candidate(host_candidate(2, 50002)).await?;
    callee.add_remote_candidate(host_candidate(1, 50000)).await?;

    let engine = &callee_factory.engines()[0];
    assert!(engine.applied_candidates().is_empty());

    let offer = caller.create_offer().await?;
    callee.accept_offer(offer).await?;
    assert_eq!(engine.applied_candidates().len(), 2);

    // Replays after the flush are still deduplicated
    callee.add_remote_candidate(host_candidate(2, 50002)).await?;
    callee.add_remote_candidate(host_candidate(3, 50004)).await?;
    let applied = engine.applied_candidates();
    assert_eq!(applied.len(), 3);
    assert_eq!(applied[2], host_candidate(3, 50004));
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    init_test_tracing();
    let factory = SimulatedEngineFactory::new();
    let media = MediaAcquisition::synthetic();
    let (session, mut events) = PeerSession::new("call-3".to_string(), &factory).await?;
    session.attach_local_stream(media.acquire(true, true).await?).await?;
    session.create_offer().await?;

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    assert!(!media.is_busy());
    assert!(factory.engines()[0].is_closed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut closed_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PeerEvent::StateChanged(ConnectionState::Closed)) {
            closed_events += 1;
        }
    }
    assert_eq!(closed_events, 1);

    // Output operations fail, inputs are ignored
    assert!(matches!(
        session.create_offer().await,
        Err(Error::NegotiationError(_))
    ));
    session.add_remote_candidate(host_candidate(9, 50010)).await?;
    Ok(())
}

#[tokio::test]
async fn test_media_change_after_negotiation_unsupported() -> Result<()> {
    init_test_tracing();
    let factory = SimulatedEngineFactory::new();
    let (session, _events) = PeerSession::new("call-4".to_string(), &factory).await?;
    session.create_offer().await?;

    let media = MediaAcquisition::synthetic();
    let late = media.acquire(false, true).await?;
    assert!(matches!(
        session.attach_local_stream(late.clone()).await,
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(matches!(
        session.create_offer().await,
        Err(Error::UnsupportedOperation(_))
    ));
    late.release();
    session.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_answer_and_candidates_race_is_serialized() -> Result<()> {
    init_test_tracing();
    for round in 0..20u32 {
        let caller_factory = SimulatedEngineFactory::new();
        let callee_factory = SimulatedEngineFactory::new();
        let call_id = format!("race-{}", round);
        let (caller, _caller_events) = PeerSession::new(call_id.clone(), &caller_factory).await?;
        let (callee, _callee_events) = PeerSession::new(call_id, &callee_factory).await?;

        let offer = caller.create_offer().await?;
        let answer = callee.accept_offer(offer).await?;

        // Whichever side wins the race, every candidate is applied once
        let answering = {
            let caller = caller.clone();
            tokio::spawn(async move { caller.accept_answer(answer).await })
        };
        let mut trickling = Vec::new();
        for n in 0..3u16 {
            let caller = caller.clone();
            trickling.push(tokio::spawn(async move {
                caller.add_remote_candidate(host_candidate(n.into(), 51000 + n * 2)).await
            }));
        }
        answering.await.expect("answer task")?;
        for task in trickling {
            task.await.expect("candidate task")?;
        }

        let mut applied = caller_factory.engines()[0].applied_candidates();
        applied.sort_by_key(|c| c.candidate.clone());
        let mut expected: Vec<_> = (0..3u16)
            .map(|n| host_candidate(n.into(), 51000 + n * 2))
            .collect();
        expected.sort_by_key(|c| c.candidate.clone());
        assert_eq!(applied, expected);
        assert!(caller_factory.engines()[0].remote_description().is_some());
    }
    Ok(())
}
