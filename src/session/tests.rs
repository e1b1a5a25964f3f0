use std::time::Duration;

use sha1::{Digest, Sha1};

use super::{Phase, TorrentSession};
use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::peer::Bitfield;
use crate::session::torrent::SessionOptions;

fn metainfo_for(content: &[u8], piece_length: u32) -> Metainfo {
    let mut hashes = Vec::new();
    for piece in content.chunks(piece_length as usize) {
        hashes.extend_from_slice(&Sha1::digest(piece));
    }
    let mut data = Vec::new();
    data.extend_from_slice(
        format!(
            "d4:infod6:lengthi{}e4:name1:f12:piece lengthi{}e6:pieces{}:",
            content.len(),
            piece_length,
            hashes.len()
        )
        .as_bytes(),
    );
    data.extend_from_slice(&hashes);
    data.extend_from_slice(b"ee");
    Metainfo::parse(&data).unwrap()
}

async fn wait_for_phase(session: &TorrentSession, phase: Phase) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(state) = session.state().await {
            if state.phase == phase {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {:?}",
            phase
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn complete_torrent_reaches_seeding() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..100u8).cycle().take(40000).collect();
    std::fs::write(dir.path().join("f"), &content).unwrap();

    let session = TorrentSession::from_metainfo(
        metainfo_for(&content, 16384),
        dir.path(),
        Config::default(),
    );
    let handles = session.start().await;
    assert!(handles.port.is_some());
    assert!(handles.err.is_some());

    wait_for_phase(&session, Phase::Seeding).await;
    let state = session.state().await.unwrap();
    assert_eq!(state.missing_pieces, Some(0));
    assert_eq!(state.left, 0);
    // the resume surface is populated
    assert!(state.info_bytes.is_some());
    assert!(state.bitfield.is_some_and(|bits| bits.is_complete()));
    session.shutdown().await;
}

#[tokio::test]
async fn empty_torrent_goes_straight_to_seeding() {
    let dir = tempfile::tempdir().unwrap();
    let session = TorrentSession::from_metainfo(
        metainfo_for(&[], 16384),
        dir.path(),
        Config::default(),
    );
    session.start().await;
    wait_for_phase(&session, Phase::Seeding).await;
    session.shutdown().await;
}

#[tokio::test]
async fn fresh_torrent_lands_in_downloading() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = vec![7; 50000];
    let session = TorrentSession::from_metainfo(
        metainfo_for(&content, 16384),
        dir.path(),
        Config::default(),
    );
    session.start().await;
    wait_for_phase(&session, Phase::Downloading).await;
    let state = session.state().await.unwrap();
    assert_eq!(state.missing_pieces, Some(4));
    assert_eq!(state.left, 50000);
    session.shutdown().await;
}

#[tokio::test]
async fn stop_is_clean_and_returns_to_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![1u8; 20000];
    let session = TorrentSession::from_metainfo(
        metainfo_for(&content, 16384),
        dir.path(),
        Config::default(),
    );
    let handles = session.start().await;
    wait_for_phase(&session, Phase::Downloading).await;

    session.stop().await;
    wait_for_phase(&session, Phase::Stopped).await;
    // clean stop: the error channel yields no error
    let err = handles.err.unwrap().await.unwrap();
    assert!(err.is_ok());
    session.shutdown().await;
}

#[tokio::test]
async fn second_start_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![2u8; 20000];
    let session = TorrentSession::from_metainfo(
        metainfo_for(&content, 16384),
        dir.path(),
        Config::default(),
    );
    let first = session.start().await;
    wait_for_phase(&session, Phase::Downloading).await;
    let before = session.state().await.unwrap();

    let second = session.start().await;
    assert!(second.err.is_none());
    assert_eq!(second.port, first.port);
    let after = session.state().await.unwrap();
    assert_eq!(after.phase, before.phase);
    assert_eq!(after.missing_pieces, before.missing_pieces);
    session.shutdown().await;
}

#[tokio::test]
async fn restart_skips_allocation_and_verification() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..200u8).cycle().take(40000).collect();
    std::fs::write(dir.path().join("f"), &content).unwrap();
    let session = TorrentSession::from_metainfo(
        metainfo_for(&content, 16384),
        dir.path(),
        Config::default(),
    );
    session.start().await;
    wait_for_phase(&session, Phase::Seeding).await;
    session.stop().await;
    wait_for_phase(&session, Phase::Stopped).await;

    // the bitfield survived the stop cycle: no allocating/verifying pass
    session.start().await;
    wait_for_phase(&session, Phase::Seeding).await;
    session.shutdown().await;
}

#[tokio::test]
async fn magnet_session_starts_acquiring_info() {
    let dir = tempfile::tempdir().unwrap();
    let session = TorrentSession::from_magnet(
        "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a",
        dir.path(),
        Config::default(),
    )
    .unwrap();
    let handles = session.start().await;
    assert!(handles.port.is_some());
    wait_for_phase(&session, Phase::AcquiringInfo).await;
    session.shutdown().await;
}

#[tokio::test]
async fn resume_bitfield_skips_verification() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![9u8; 30000];
    let metainfo = metainfo_for(&content, 16384);
    // content is NOT on disk; a full resume bitfield must still win
    let mut resume = Bitfield::new(metainfo.info.piece_count());
    resume.set_all();

    let session = TorrentSession::new(SessionOptions {
        info_hash: metainfo.info_hash(),
        info: Some(metainfo.info),
        data_dir: dir.path().to_path_buf(),
        resume_bitfield: Some(resume),
        ..Default::default()
    });
    session.start().await;
    wait_for_phase(&session, Phase::Seeding).await;
    session.shutdown().await;
}
