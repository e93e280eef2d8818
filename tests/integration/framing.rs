use crate::*;

use scenecast_core::scene_update::{CommandLog, FlushMetadata, SceneUpdate};
use scenecast_services::{CoordinatorError, SceneUpdateDeserializer, SceneUpdateSerializer};

/// Frame `update` into packets of `capacity` and ship them over a channel.
fn send_update(update: &SceneUpdate, capacity: usize) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut packet = vec![0u8; capacity];
    SceneUpdateSerializer::new(update)
        .write_to_packets(&mut packet, |bytes| tx.send(bytes.to_vec()).is_ok())
        .unwrap();
    rx
}

async fn receive_update(mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Result<SceneUpdate> {
    let mut decoder = SceneUpdateDeserializer::new();
    while let Some(packet) = rx.recv().await {
        if let Some(update) = decoder.process_packet(&packet)? {
            return Ok(update);
        }
    }
    bail!("channel closed before the update was complete")
}

/// A producer flushes a scene update referencing its resources; the consumer
/// publishes what arrived and can resolve the whole update.
#[tokio::test]
async fn scene_update_resources_become_resolvable() {
    let net = Loopback::new(settings(1500));
    let held: Vec<ManagedResource> = (60..63)
        .map(|seed| net.producer.manage_resource(test_resource(seed, 900), false))
        .collect();
    let hashes: Vec<_> = held.iter().map(|r| r.hash()).collect();

    let resolved = net.producer.resolve_for_update(&hashes).unwrap();
    let mut commands = CommandLog::new();
    for hash in &hashes {
        commands.push(7, hash.as_bytes()).unwrap();
    }
    let update = SceneUpdate::new(commands)
        .with_resources(resolved.iter().map(|r| r.resource().clone()).collect())
        .with_flush(FlushMetadata {
            flush_counter: 1,
            ..Default::default()
        });

    let received = receive_update(send_update(&update, 256)).await.unwrap();
    assert_eq!(received.commands.len(), 3);
    assert_eq!(received.flush.as_ref().map(|f| f.flush_counter), Some(1));

    let published: Vec<ManagedResource> = received
        .resources
        .iter()
        .map(|r| net.consumer.manage_resource(Resource::clone(r), false))
        .collect();
    let referenced: Vec<ResourceContentHash> = received
        .commands
        .iter()
        .map(|(_, payload)| ResourceContentHash(payload.try_into().unwrap()))
        .collect();
    let on_consumer = net.consumer.resolve_for_update(&referenced).unwrap();
    assert_eq!(on_consumer.len(), 3);
    assert_eq!(published.len(), 3);
}

/// Resolving an update whose resources are not all resident fails as a whole.
#[tokio::test]
async fn update_with_missing_resource_fails() {
    let net = Loopback::new(settings(1500));
    let present = net.producer.manage_resource(test_resource(70, 10), false);
    let absent = test_resource(71, 10).hash();

    match net.producer.resolve_for_update(&[present.hash(), absent]) {
        Err(CoordinatorError::MissingResources(missing)) => assert_eq!(missing, vec![absent]),
        Ok(_) => panic!("update with a missing resource must not resolve"),
    }
}

/// Losing the first packet of an update means it never reassembles.
#[tokio::test]
async fn lost_packet_breaks_update() {
    let resource = Arc::new(test_resource(80, 3000));
    let update = SceneUpdate::new(CommandLog::new()).with_resources(vec![resource]);

    let mut rx = send_update(&update, 512);
    let first = rx.recv().await.unwrap();
    assert!(!first.is_empty());

    let mut decoder = SceneUpdateDeserializer::new();
    let mut failed = false;
    while let Ok(packet) = rx.try_recv() {
        match decoder.process_packet(&packet) {
            Ok(Some(_)) => panic!("update reassembled without its first packet"),
            Ok(None) => {}
            Err(_) => failed = true,
        }
    }
    assert!(failed);
}
