use crate::*;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use scenecast_core::resource::CompressionState;
use scenecast_services::ResourceFileWriter;

const ALICE: RequesterId = RequesterId(1);
const BOB: RequesterId = RequesterId(2);

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "scenecast-it-{}-{}-{}",
        tag,
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Two requesters ask for the same resources; the producer sees one request
/// and both get every resource.
#[tokio::test]
async fn remote_fetch_fans_out_to_all_requesters() {
    let net = Loopback::new(settings(1500));
    let held: Vec<ManagedResource> = (1..=3)
        .map(|seed| net.producer.manage_resource(test_resource(seed, 4000), false))
        .collect();
    let hashes: Vec<_> = held.iter().map(|r| r.hash()).collect();

    net.consumer.request_async(&hashes, ALICE, PRODUCER);
    net.consumer.request_async(&hashes, BOB, PRODUCER);

    let alice = wait_for_arrivals(&net.consumer, ALICE, 3).await.unwrap();
    let bob = wait_for_arrivals(&net.consumer, BOB, 3).await.unwrap();
    for got in &alice {
        let original = held.iter().find(|r| r.hash() == got.hash()).unwrap();
        assert_eq!(got.decompressed_data(), original.decompressed_data());
        assert_eq!(got.name(), original.name());
    }
    assert_eq!(bob.len(), 3);

    assert_eq!(net.producer.statistics().snapshot().resources_sent, 3);
    assert_eq!(net.consumer.statistics().snapshot().resources_received, 3);
}

/// Packets far smaller than a resource still carry it intact.
#[tokio::test]
async fn small_packets_split_resources() {
    let net = Loopback::new(settings(64));
    let held = net.producer.manage_resource(test_resource(9, 2000), false);

    net.consumer.request_async(&[held.hash()], ALICE, PRODUCER);
    let arrived = wait_for_arrivals(&net.consumer, ALICE, 1).await.unwrap();
    assert_eq!(arrived[0].decompressed_data(), held.decompressed_data());
    assert!(net.producer.statistics().snapshot().packets_sent > 30);
}

/// A hash the producer does not have is reported back and the consumer's
/// demand for it is cleared.
#[tokio::test]
async fn unavailable_resources_clear_demand() {
    let net = Loopback::new(settings(1500));
    let known = net.producer.manage_resource(test_resource(20, 100), false);
    let later = test_resource(21, 100);
    let later_hash = later.hash();

    net.consumer.request_async(&[known.hash(), later_hash], ALICE, PRODUCER);
    let arrived = wait_for_arrivals(&net.consumer, ALICE, 1).await.unwrap();
    assert_eq!(arrived[0].hash(), known.hash());
    settle().await;
    assert!(net.consumer.pop_arrived(ALICE).is_empty());

    // Once the producer has it, asking again goes out over the wire.
    let _later = net.producer.manage_resource(later, false);
    net.consumer.request_async(&[later_hash], ALICE, PRODUCER);
    let arrived = wait_for_arrivals(&net.consumer, ALICE, 1).await.unwrap();
    assert_eq!(arrived[0].hash(), later_hash);
}

/// The producer serves resources straight from its resource file.
#[tokio::test]
async fn producer_serves_from_resource_file() {
    let net = Loopback::new(settings(1500));
    let dir = temp_dir("producer-file");
    let path = dir.join("scene.scrf");
    let resources: Vec<Arc<Resource>> = (30..34).map(|s| Arc::new(test_resource(s, 3000))).collect();
    ResourceFileWriter::new(3).write(&path, &resources).unwrap();
    net.producer.add_resource_file(&path).unwrap();

    let hashes: Vec<_> = resources.iter().map(|r| r.hash()).collect();
    net.consumer.request_async(&hashes, ALICE, PRODUCER);
    let arrived = wait_for_arrivals(&net.consumer, ALICE, hashes.len()).await.unwrap();

    for got in arrived {
        // Stored compressed, so it travels and arrives compressed.
        assert_eq!(got.compression_state(), CompressionState::CompressedOnly);
        let mut copy = Resource::clone(got.resource());
        copy.decompress().unwrap();
        let original = resources.iter().find(|r| r.hash() == got.hash()).unwrap();
        assert_eq!(copy.decompressed_data(), original.decompressed_data());
    }
    assert_eq!(
        net.producer.statistics().snapshot().resources_loaded_from_file,
        hashes.len() as u64
    );
    // Nothing stays resident on the producer after sending.
    assert!(net.producer.resources().is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

/// A consumer with its own copy on disk never asks the producer.
#[tokio::test]
async fn local_resource_file_wins_over_network() {
    let net = Loopback::new(settings(1500));
    let dir = temp_dir("consumer-file");
    let path = dir.join("cache.scrf");
    let resource = Arc::new(test_resource(40, 500));
    ResourceFileWriter::new(0).write(&path, &[resource.clone()]).unwrap();
    net.consumer.add_resource_file(&path).unwrap();

    net.consumer.request_async(&[resource.hash()], ALICE, PRODUCER);
    let arrived = wait_for_arrivals(&net.consumer, ALICE, 1).await.unwrap();
    assert_eq!(arrived[0].decompressed_data(), resource.decompressed_data());
    assert_eq!(net.producer.statistics().snapshot().packets_sent, 0);
    assert_eq!(net.consumer.statistics().snapshot().resources_loaded_from_file, 1);

    let _ = std::fs::remove_dir_all(dir);
}

/// Disconnecting drops demand on that peer; reconnecting starts clean.
#[tokio::test]
async fn reconnect_after_disconnect() {
    let net = Loopback::new(settings(1500));
    let held = net.producer.manage_resource(test_resource(50, 800), false);

    net.consumer.peer_disconnected(PRODUCER);
    net.consumer.new_peer(PRODUCER);
    net.consumer.request_async(&[held.hash()], ALICE, PRODUCER);
    let arrived = wait_for_arrivals(&net.consumer, ALICE, 1).await.unwrap();
    assert_eq!(arrived[0].hash(), held.hash());
}
