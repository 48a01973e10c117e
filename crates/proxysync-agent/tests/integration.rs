use proxysync_core::{
    AllowAll, InMemoryMatchSpace, LocalSubscription, MemoryStore, MemoryTransport, MessageType,
    NeighbourListener, ProxyConfig, ProxyHandler,
};
use proxysync_proto::{ProxyEnvelope, TopicScheme};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

fn parse_mqtt_url(url: &str) -> (String, u16) {
    let url = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let parts: Vec<&str> = url.split(':').collect();

    let host = parts.first().copied().unwrap_or("localhost").to_string();
    let port = parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(1883);

    (host, port)
}

async fn spawn_eventloop(mut eventloop: EventLoop) {
    loop {
        if eventloop.poll().await.is_err() {
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_message_crosses_broker() {
    if std::env::var("PROXYSYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set PROXYSYNC_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("PROXYSYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_mqtt_url(&broker);

    let scheme = TopicScheme::new("integration");
    let topic_space = Uuid::new_v4();
    let engine_a = Uuid::new_v4();
    let engine_b = Uuid::new_v4();

    // Engine A advertises a local consumer to B
    let transport_a = Arc::new(MemoryTransport::new());
    let match_space_a = Arc::new(InMemoryMatchSpace::new());
    match_space_a.create_topic_space(topic_space, "prices");
    let handler_a = ProxyHandler::new(
        ProxyConfig::new(engine_a, "bus-a"),
        match_space_a.clone(),
        transport_a.clone(),
        Arc::new(MemoryStore::new()),
        tokio::runtime::Handle::current(),
    );
    handler_a.start();
    handler_a.create_neighbour(engine_b, "bus-a").unwrap();
    transport_a.drain();
    let local = LocalSubscription::new(topic_space, "prices", "stock/ibm");
    match_space_a.add_local_subscription(local.clone()).unwrap();
    handler_a.subscribe_event(&local).unwrap();
    let (_, outbound) = transport_a.drain().pop().unwrap();
    assert_eq!(outbound.message_type, MessageType::Create);

    // Engine B listens on its inbox
    let inbox = scheme.inbox(engine_b);
    let mut sub_opts = MqttOptions::new(format!("sub-{}", Uuid::new_v4()), host.clone(), port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client
        .subscribe(&inbox, QoS::AtLeastOnce)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send(publish.payload.to_vec());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let mut pub_opts = MqttOptions::new(format!("pub-{}", Uuid::new_v4()), host, port);
    pub_opts.set_keep_alive(Duration::from_secs(5));
    let (pub_client, pub_eventloop) = AsyncClient::new(pub_opts, 10);
    tokio::spawn(spawn_eventloop(pub_eventloop));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let payload = ProxyEnvelope::new(outbound.clone()).to_cbor().unwrap();
    pub_client
        .publish(&inbox, QoS::AtLeastOnce, false, payload)
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for MQTT message")
        .expect("subscriber dropped");

    let decoded = ProxyEnvelope::from_cbor(&received).unwrap().into_message();
    assert_eq!(decoded, outbound);

    // Engine B applies it: the neighbour now holds the interest
    let match_space_b = Arc::new(InMemoryMatchSpace::new());
    match_space_b.create_topic_space(topic_space, "prices");
    let handler_b = Arc::new(ProxyHandler::new(
        ProxyConfig::new(engine_b, "bus-a"),
        match_space_b,
        Arc::new(MemoryTransport::new()),
        Arc::new(MemoryStore::new()),
        tokio::runtime::Handle::current(),
    ));
    handler_b.start();
    handler_b.create_neighbour(engine_a, "bus-a").unwrap();
    let listener = NeighbourListener::new(Arc::clone(&handler_b), Arc::new(AllowAll));

    listener.on_message(&decoded).unwrap();

    let neighbour = handler_b.registry().neighbour(engine_a).unwrap();
    assert_eq!(neighbour.subscription_count(), 1);
}
