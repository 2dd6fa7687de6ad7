use std::{net::SocketAddr, time::Duration};
use sha1::Digest;
use crate::{config::Config, metainfo::Info, BLOCK_SIZE};
use super::{Phase, Torrent, TorrentParams};

fn params(info: Info, dir: &std::path::Path) -> TorrentParams {
    TorrentParams {
        info_hash: info.info_hash(),
        info: Some(info),
        bitfield: None,
        trackers: Vec::new(),
        webseeds: Vec::new(),
        data_dir: dir.to_path_buf(),
        config: Config::default(),
        dht: None,
        pool: None,
    }
}

// Bencodes a single-file info dict for the given content.
fn info_for(name: &str, data: &[u8], piece_length: usize) -> Info {
    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_length) {
        let mut hasher = sha1::Sha1::new();
        hasher.update(chunk);
        let hash: [u8; 20] = hasher.finalize().into();
        pieces.extend_from_slice(&hash);
    }
    let mut raw = Vec::new();
    raw.extend_from_slice(format!("d6:lengthi{}e4:name{}:{}", data.len(), name.len(), name).as_bytes());
    raw.extend_from_slice(format!("12:piece lengthi{}e6:pieces{}:", piece_length, pieces.len()).as_bytes());
    raw.extend_from_slice(&pieces);
    raw.push(b'e');
    Info::from_bytes(&raw).unwrap()
}

async fn wait_for_phase(torrent: &Torrent, want: Phase) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if torrent.phase().await.unwrap() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", want));
}

// A torrent with no pieces allocates and goes straight to seeding.
#[tokio::test]
async fn test_empty_torrent_seeds_after_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let info = info_for("empty.bin", &[], 0x4000);
    let (torrent, mut err_rx) = Torrent::new(params(info, dir.path()));

    torrent.start();
    wait_for_phase(&torrent, Phase::Seeding).await;
    assert!(torrent.port().await.unwrap().is_some());

    torrent.stop();
    wait_for_phase(&torrent, Phase::Stopped).await;
    assert_eq!(torrent.port().await.unwrap(), None);
    assert!(err_rx.try_recv().is_err());
}

// Start/stop cycles land in the same state every time.
#[tokio::test]
async fn test_restart_reaches_same_state() {
    let dir = tempfile::tempdir().unwrap();
    let data = vec![0x5au8; 10_000];
    std::fs::write(dir.path().join("data.bin"), &data).unwrap();
    let info = info_for("data.bin", &data, 0x4000);
    let (torrent, mut err_rx) = Torrent::new(params(info, dir.path()));

    for _ in 0..2 {
        torrent.start();
        wait_for_phase(&torrent, Phase::Seeding).await;
        torrent.stop();
        wait_for_phase(&torrent, Phase::Stopped).await;
    }
    assert!(err_rx.try_recv().is_err());
}

// Full transfer over loopback: a seeding instance serves a leeching one.
#[tokio::test]
async fn test_download_from_seeder() {

    let piece_length = BLOCK_SIZE;
    let data: Vec<u8> = (0..piece_length * 2 + 7_000).map(|i| (i % 253) as u8).collect();

    let seed_dir = tempfile::tempdir().unwrap();
    std::fs::write(seed_dir.path().join("data.bin"), &data).unwrap();
    let info = info_for("data.bin", &data, piece_length);

    let (seeder, mut seeder_err) = Torrent::new(params(info.clone(), seed_dir.path()));
    seeder.start();
    wait_for_phase(&seeder, Phase::Seeding).await;
    let seed_port = seeder.port().await.unwrap().unwrap();

    let leech_dir = tempfile::tempdir().unwrap();
    let (leecher, mut leecher_err) = Torrent::new(params(info, leech_dir.path()));
    leecher.start();
    wait_for_phase(&leecher, Phase::Downloading).await;

    let seed_addr: SocketAddr = format!("127.0.0.1:{}", seed_port).parse().unwrap();
    leecher.add_peers(vec![seed_addr]);

    wait_for_phase(&leecher, Phase::Seeding).await;
    let downloaded = std::fs::read(leech_dir.path().join("data.bin")).unwrap();
    assert_eq!(downloaded, data);

    // Clean stop on both ends surfaces no error.
    leecher.stop();
    seeder.stop();
    wait_for_phase(&leecher, Phase::Stopped).await;
    wait_for_phase(&seeder, Phase::Stopped).await;
    assert!(seeder_err.try_recv().is_err());
    assert!(leecher_err.try_recv().is_err());
}

// Metadata acquisition over loopback: the leecher starts with only the
// info-hash and pulls the info dictionary from the seeder.
#[tokio::test]
async fn test_acquire_info_from_peer() {

    let data: Vec<u8> = (0..BLOCK_SIZE + 300).map(|i| (i % 71) as u8).collect();
    let seed_dir = tempfile::tempdir().unwrap();
    std::fs::write(seed_dir.path().join("data.bin"), &data).unwrap();
    let info = info_for("data.bin", &data, BLOCK_SIZE);
    let info_hash = info.info_hash();

    let (seeder, _seeder_err) = Torrent::new(params(info, seed_dir.path()));
    seeder.start();
    wait_for_phase(&seeder, Phase::Seeding).await;
    let seed_port = seeder.port().await.unwrap().unwrap();

    let leech_dir = tempfile::tempdir().unwrap();
    let (leecher, mut leecher_err) = Torrent::new(TorrentParams {
        info_hash,
        info: None,
        bitfield: None,
        trackers: Vec::new(),
        webseeds: Vec::new(),
        data_dir: leech_dir.path().to_path_buf(),
        config: Config::default(),
        dht: None,
        pool: None,
    });
    leecher.start();
    wait_for_phase(&leecher, Phase::AcquiringInfo).await;

    let seed_addr: SocketAddr = format!("127.0.0.1:{}", seed_port).parse().unwrap();
    leecher.add_peers(vec![seed_addr]);

    // Info comes from the metadata extension, then the payload follows.
    wait_for_phase(&leecher, Phase::Seeding).await;
    let downloaded = std::fs::read(leech_dir.path().join("data.bin")).unwrap();
    assert_eq!(downloaded, data);
    assert!(leecher_err.try_recv().is_err());

    leecher.stop();
    seeder.stop();
}
