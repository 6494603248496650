use std::{env::temp_dir, iter::repeat_with};

use fdbus_broker::{collaborators::NullControllerChannel, Bus, BusConfig};
use futures_util::StreamExt;
use ntest::timeout;
use tokio::{select, sync::oneshot};
use zbus::{
    connection,
    fdo::{DBusProxy, RequestNameFlags, RequestNameReply},
    proxy::CacheProperties,
};

async fn random_socket_path() -> std::path::PathBuf {
    let dir = temp_dir().join("fdbus-broker-tests");
    let _ = tokio::fs::create_dir(&dir).await;
    let name: String = repeat_with(fastrand::alphanumeric).take(12).collect();
    dir.join(name)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn request_and_release_name() {
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

    let ret = drive_client(&address).await;
    let _ = tx.send(());
    let bus = handle.await.unwrap();
    bus.cleanup().await.unwrap();
    ret.unwrap();
}

async fn drive_client(address: &str) -> anyhow::Result<()> {
    let conn = connection::Builder::address(address)?.build().await?;
    let unique_name = conn.unique_name().unwrap().to_string();
    anyhow::ensure!(unique_name.starts_with(':'), "unique name not assigned");

    let dbus = DBusProxy::builder(&conn)
        .cache_properties(CacheProperties::No)
        .build()
        .await?;
    let mut acquired = dbus.receive_name_acquired().await?;

    let name = "com.example.FdbusBrokerTest";
    let reply = dbus
        .request_name(name.try_into()?, RequestNameFlags::DoNotQueue.into())
        .await?;
    anyhow::ensure!(
        reply == RequestNameReply::PrimaryOwner,
        "expected PrimaryOwner, got {reply:?}"
    );

    let signal = acquired
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("no NameAcquired"))?;
    let args = signal.args()?;
    anyhow::ensure!(args.name().as_str() == name, "NameAcquired for wrong name");

    let owner = dbus.get_name_owner(name.try_into()?).await?;
    anyhow::ensure!(
        owner.to_string() == unique_name,
        "GetNameOwner returned {owner}, expected {unique_name}"
    );

    let names = dbus.list_names().await?;
    anyhow::ensure!(
        names.iter().any(|n| n.as_str() == name),
        "ListNames did not include {name}"
    );
    anyhow::ensure!(
        names.iter().any(|n| n.as_str() == unique_name),
        "ListNames did not include the caller's own unique name"
    );

    let reply = dbus.release_name(name.try_into()?).await?;
    anyhow::ensure!(
        reply == zbus::fdo::ReleaseNameReply::Released,
        "expected Released, got {reply:?}"
    );

    anyhow::ensure!(
        dbus.get_name_owner(name.try_into()?).await.is_err(),
        "name should have no owner after release"
    );

    Ok(())
}
