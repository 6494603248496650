use std::{env::temp_dir, iter::repeat_with};

use fdbus_broker::{
    collaborators::NullControllerChannel,
    config::{Access, Name, NameOwnership, Operation, Policy},
    policy::Ruleset,
    user::UserLimits,
    Bus, BusConfig,
};
use ntest::timeout;
use tokio::{select, sync::oneshot};
use zbus::{
    connection,
    fdo::{DBusProxy, RequestNameFlags},
    proxy::CacheProperties,
};

async fn random_socket_path() -> std::path::PathBuf {
    let dir = temp_dir().join("fdbus-broker-tests");
    let _ = tokio::fs::create_dir(&dir).await;
    let name: String = repeat_with(fastrand::alphanumeric).take(12).collect();
    dir.join(name)
}

fn deny_ownership_config(name: &str) -> BusConfig {
    let ruleset = Ruleset::from_policies(vec![Policy::MandatoryContext(vec![(
        Access::Deny,
        Operation::Own(NameOwnership {
            own: Some(Name::Exact(name.to_string())),
        }),
    )])]);
    BusConfig {
        limits: UserLimits::default(),
        ruleset,
    }
}

/// `RequestName` for a name a `<policy>` mandatory-context rule denies comes back as an access
/// error rather than granting ownership.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(15000)]
async fn request_name_denied_by_policy() {
    let path = random_socket_path().await;
    let denied_name = "com.example.FdbusBrokerDeniedName";
    let mut bus = Bus::bind(path.clone(), deny_ownership_config(denied_name))
        .await
        .unwrap();
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
        let conn = connection::Builder::address(&address)?.build().await?;
        let dbus = DBusProxy::builder(&conn)
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        let result = dbus
            .request_name(denied_name.try_into()?, RequestNameFlags::DoNotQueue.into())
            .await;
        anyhow::ensure!(result.is_err(), "expected policy to deny ownership of {denied_name}");
        Ok(())
    }
    .await;

    let _ = tx.send(());
    let bus = handle.await.unwrap();
    bus.cleanup().await.unwrap();
    ret.unwrap();
}
