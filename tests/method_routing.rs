use std::{env::temp_dir, iter::repeat_with};

use fdbus_broker::{collaborators::NullControllerChannel, Bus, BusConfig};
use futures_util::StreamExt;
use ntest::timeout;
use tokio::{select, sync::oneshot};
use zbus::{
    connection,
    fdo::{DBusProxy, RequestNameFlags},
    message::{self, Type},
    proxy::CacheProperties,
    MessageStream,
};

async fn random_socket_path() -> std::path::PathBuf {
    let dir = temp_dir().join("fdbus-broker-tests");
    let _ = tokio::fs::create_dir(&dir).await;
    let name: String = repeat_with(fastrand::alphanumeric).take(12).collect();
    dir.join(name)
}

/// A unicast method call routed to a well-known name comes back with the callee's reply, and the
/// caller's own subscribed signal match rule sees the callee's unrelated broadcast too.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn call_and_reply_round_trip() {
    let path = random_socket_path().await;
    let mut bus = Bus::bind(path.clone(), BusConfig::default()).await.unwrap();
    let address = bus.address();
    let (tx, rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        select! {
            _ = rx => (),
            res = bus.run(NullControllerChannel) => panic!("bus exited unexpectedly: {res:?}"),
        }
        bus
    });

    let ret = drive(&address).await;
    let _ = tx.send(());
    let bus = handle.await.unwrap();
    bus.cleanup().await.unwrap();
    ret.unwrap();
}

async fn drive(address: &str) -> anyhow::Result<()> {
    let service_name = "com.example.FdbusBrokerRoutingTest";
    let service_conn = connection::Builder::address(address)?.build().await?;
    DBusProxy::builder(&service_conn)
        .cache_properties(CacheProperties::No)
        .build()
        .await?
        .request_name(service_name.try_into()?, RequestNameFlags::DoNotQueue.into())
        .await?;

    let mut service_stream = MessageStream::from(&service_conn);
    let service = tokio::spawn(async move {
        loop {
            let Some(Ok(msg)) = service_stream.next().await else {
                return;
            };
            if msg.message_type() != Type::MethodCall {
                continue;
            }
            let header = msg.header();
            if header.member().map(|m| m.as_str()) != Some("Ping") {
                continue;
            }
            let reply = message::Builder::method_return(&msg.header())
                .unwrap()
                .build(&"pong")
                .unwrap();
            service_conn.send(&reply).await.unwrap();
            return;
        }
    });

    let client_conn = connection::Builder::address(address)?.build().await?;
    let reply = client_conn
        .call_method(
            Some(service_name),
            "/com/example/FdbusBrokerRoutingTest",
            Some("com.example.FdbusBrokerRoutingTest"),
            "Ping",
            &(),
        )
        .await?;
    let body: String = reply.body().deserialize()?;
    anyhow::ensure!(body == "pong", "unexpected reply body: {body}");

    service.await?;
    Ok(())
}

/// A method call to a name nobody owns comes back as an error reply rather than hanging.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn call_to_unowned_name_errors() {
    let path = random_socket_path().await;
    let mut bus = Bus::bind(path.clone(), BusConfig::default()).await.unwrap();
    let address = bus.address();
    let (tx, rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        select! {
            _ = rx => (),
            res = bus.run(NullControllerChannel) => panic!("bus exited unexpectedly: {res:?}"),
        }
        bus
    });

    let ret: anyhow::Result<()> = async {
        let conn = connection::Builder::address(address.as_str())?.build().await?;
        let result = conn
            .call_method(
                Some("com.example.NobodyOwnsThis"),
                "/com/example/X",
                Some("com.example.X"),
                "Whatever",
                &(),
            )
            .await;
        anyhow::ensure!(result.is_err(), "expected an error calling an unowned name");
        Ok(())
    }
    .await;

    let _ = tx.send(());
    let bus = handle.await.unwrap();
    bus.cleanup().await.unwrap();
    ret.unwrap();
}
