mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use jobctl_common::protocol::{read_frame, write_frame};
use jobctl_common::{Frame, JobCode};
use jobd::journal::JournalVerifier;
use jobd::{JobEvent, LostReason, SlotStatus};
use jobd_client::{ClientError, WorkerClient};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const CLIENT_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn valid_code_binds_once_and_reuse_is_rejected() {
    let launcher = Arc::new(RecordingLauncher::default());
    let control = start(loopback_config(), launcher).await;
    let (sink, mut events) = channel();
    let report = control.dispatch(&single_replica_profile(), "worker", sink).await;
    let slot = &report.slots[0];

    let client = WorkerClient::connect_addr(master_addr(&control), slot.code, CLIENT_WAIT)
        .await
        .unwrap();
    match next_event(&mut events).await {
        JobEvent::Connected(session) => {
            assert_eq!(session.job_number(), slot.job_number);
            assert_eq!(session.job_id(), report.job_id);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(control.slot_status(slot.job_number), Some(SlotStatus::Bound));

    let second = WorkerClient::connect_addr(master_addr(&control), slot.code, CLIENT_WAIT).await;
    assert!(matches!(second, Err(ClientError::Rejected)));

    let stats = control.stats();
    assert_eq!(stats.bound, 1);
    assert_eq!(stats.rejected, 1);
    drop(client);
}

#[tokio::test]
async fn unknown_code_is_rejected_and_pending_slot_untouched() {
    let control = start(loopback_config(), Arc::new(RecordingLauncher::default())).await;
    let (sink, _events) = channel();
    let report = control.dispatch(&single_replica_profile(), "worker", sink).await;

    let result =
        WorkerClient::connect_addr(master_addr(&control), JobCode::generate(), CLIENT_WAIT).await;
    assert!(matches!(result, Err(ClientError::Rejected)));
    assert_eq!(
        control.slot_status(report.slots[0].job_number),
        Some(SlotStatus::Pending)
    );
    assert_eq!(control.stats().rejected, 1);
}

#[tokio::test]
async fn malformed_identification_is_rejected() {
    let control = start(loopback_config(), Arc::new(RecordingLauncher::default())).await;

    let mut stream = TcpStream::connect(master_addr(&control)).await.unwrap();
    assert_eq!(read_frame(&mut stream).await.unwrap(), Frame::IdentifyRequest);
    write_frame(&mut stream, Frame::ConnectedAck).await.unwrap();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(CLIENT_WAIT, stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(control.stats().rejected, 1);
}

#[tokio::test]
async fn silent_connection_is_lost_after_timeout() {
    let mut config = loopback_config();
    config.identify_timeout_secs = 1;
    let control = start(config, Arc::new(RecordingLauncher::default())).await;

    let mut stream = TcpStream::connect(master_addr(&control)).await.unwrap();
    assert_eq!(read_frame(&mut stream).await.unwrap(), Frame::IdentifyRequest);

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(4), stream.read(&mut buf))
        .await
        .expect("master should close a silent connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    let stats = control.stats();
    assert_eq!(stats.handshake_lost, 1);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn bound_session_relays_both_directions() {
    let control = start(loopback_config(), Arc::new(RecordingLauncher::default())).await;
    let (sink, mut events) = channel();
    let report = control.dispatch(&single_replica_profile(), "worker", sink).await;

    let mut client =
        WorkerClient::connect_addr(master_addr(&control), report.slots[0].code, CLIENT_WAIT)
            .await
            .unwrap();
    let session = match next_event(&mut events).await {
        JobEvent::Connected(session) => session,
        other => panic!("unexpected event {:?}", other),
    };

    client.send(b"result 42").await.unwrap();
    match next_event(&mut events).await {
        JobEvent::Data { job_number, data } => {
            assert_eq!(job_number, session.job_number());
            assert_eq!(data, b"result 42");
        }
        other => panic!("unexpected event {:?}", other),
    }

    session.send(b"stop".to_vec()).unwrap();
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = client.recv(&mut buf[filled..]).await.unwrap();
        assert!(n > 0);
        filled += n;
    }
    assert_eq!(&buf, b"stop");

    drop(client);
    match next_event(&mut events).await {
        JobEvent::Lost { job_number, reason } => {
            assert_eq!(job_number, session.job_number());
            assert_eq!(reason, LostReason::PeerClosed);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        control.slot_status(session.job_number()),
        Some(SlotStatus::Released)
    );
    assert!(control.job_finished(report.job_id));
    assert_eq!(control.stats().sessions_released, 1);
}

#[tokio::test]
async fn journal_records_a_verifiable_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobd.journal");
    let mut config = loopback_config();
    config.journal_path = Some(path.to_string_lossy().into_owned());
    config.journal_secret = "journal-test".to_string();

    let control = start(config, Arc::new(RecordingLauncher::default())).await;
    let (sink, mut events) = channel();
    let report = control.dispatch(&single_replica_profile(), "worker", sink).await;

    let _client =
        WorkerClient::connect_addr(master_addr(&control), report.slots[0].code, CLIENT_WAIT)
            .await
            .unwrap();
    next_event(&mut events).await;
    let rejected =
        WorkerClient::connect_addr(master_addr(&control), report.slots[0].code, CLIENT_WAIT).await;
    assert!(rejected.is_err());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("\"DISPATCH\""));
    assert!(contents.contains("\"BOUND\""));
    assert!(contents.contains("\"REJECTED\""));
    assert!(JournalVerifier::new(b"journal-test").verify_file(&path).unwrap());
}
