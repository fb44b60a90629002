use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use cellstore::{
    config::RemoteConfig,
    remote::RemoteBufferLayer,
    transformation_cache::{Pin, RunOptions},
    value::Value,
    Buffer, Celltype, Checksum, Config, Context, Error, Transformation,
};
use pretty_assertions::assert_eq;
use url::Url;

mod common;

use common::{setup_logging, BufferServer, Increment};

async fn context(remote: RemoteConfig) -> anyhow::Result<Context> {
    let config = Config {
        remote,
        ..Default::default()
    };
    Context::from_config(config).await
}

#[tokio::test]
async fn reads_from_read_servers() -> anyhow::Result<()> {
    setup_logging();
    let server = BufferServer::default();
    let url = server.spawn().await?;
    let checksum = server.insert("served\n");

    let ctx = context(RemoteConfig {
        read_servers: vec![url],
        ..Default::default()
    })
    .await?;
    assert!(ctx.buffers().get_local(&checksum).is_none());
    assert!(ctx.buffers().buffer_check(&checksum).await);
    assert_eq!(ctx.get_buffer(&checksum).await?, Buffer::from("served\n"));
    assert!(ctx.remote().is_known(&checksum));
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn rejects_buffers_with_the_wrong_checksum() -> anyhow::Result<()> {
    setup_logging();
    let server = BufferServer::default();
    let url = server.spawn().await?;
    let checksum = Checksum::new(b"expected\n");
    server.insert_corrupt(&checksum, "something else\n");

    let ctx = context(RemoteConfig {
        read_servers: vec![url],
        ..Default::default()
    })
    .await?;
    let err = ctx.get_buffer(&checksum).await.unwrap_err();
    assert!(matches!(err, Error::CacheMiss(_)), "{err:?}");
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn changing_wrong_content_is_downloaded_twice() -> anyhow::Result<()> {
    setup_logging();
    let requests = Arc::new(AtomicUsize::new(0));
    let app = {
        let requests = requests.clone();
        axum::Router::new().route(
            "/{hex}",
            axum::routing::get(move || {
                let n = requests.fetch_add(1, Ordering::SeqCst);
                async move { format!("wrong {n}\n") }
            }),
        )
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    let url: Url = format!("http://{addr}/").parse()?;

    let ctx = context(RemoteConfig::default()).await?;
    let checksum = Checksum::new(b"right\n");
    let fetch = ctx.remote().server_get(&url, &checksum);
    let buffer = tokio::time::timeout(Duration::from_secs(5), fetch).await?;
    assert!(buffer.is_none());
    assert_eq!(requests.load(Ordering::SeqCst), 2);
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn persistent_references_are_uploaded() -> anyhow::Result<()> {
    setup_logging();
    let server = BufferServer::default();
    let url = server.spawn().await?;
    let ctx = context(RemoteConfig {
        write_server: Some(url),
        ..Default::default()
    })
    .await?;
    assert!(ctx.remote().can_write());

    let buffer = Buffer::from("keep me\n");
    let checksum = buffer.checksum();
    let first = ctx
        .buffers()
        .incref_buffer(&checksum, buffer.clone(), true)
        .await;
    assert!(server.contains(&checksum));
    assert_eq!(server.puts(), 1);

    // written once
    let second = ctx.buffers().incref_buffer(&checksum, buffer, true).await;
    assert_eq!(server.puts(), 1);
    drop(first);
    drop(second);

    // temporary buffers stay local
    let temp = Buffer::from("temporary\n");
    ctx.buffers().cache(&temp.checksum(), temp.clone()).await;
    assert!(!server.contains(&temp.checksum()));
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn transformations_are_uploaded() -> anyhow::Result<()> {
    setup_logging();
    let server = BufferServer::default();
    let url = server.spawn().await?;
    let remote = RemoteBufferLayer::from_config(RemoteConfig {
        write_server: Some(url),
        ..Default::default()
    })
    .await?;
    let ctx = Context::builder()
        .remote(remote)
        .executor(Arc::new(Increment::default()))
        .build();
    let input = ctx
        .converter()
        .store(&Value::Json(serde_json::json!(1)), Celltype::Plain)
        .await?;
    let tf = Transformation::default()
        .with_pin("a", Pin::new(Celltype::Plain, input))
        .with_language("python");
    let result = ctx.run_transformation(&tf, RunOptions::default()).await?;
    assert_eq!(result, Checksum::new(b"2\n"));
    assert!(server.contains(&tf.checksum()));
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn missing_persistent_buffers_are_uploaded_when_found() -> anyhow::Result<()> {
    setup_logging();
    let server = BufferServer::default();
    let url = server.spawn().await?;
    let ctx = context(RemoteConfig {
        write_server: Some(url),
        ..Default::default()
    })
    .await?;

    let buffer = Buffer::from("late\n");
    let checksum = buffer.checksum();
    let guard = ctx.buffers().incref(&checksum, true).await;
    assert!(ctx.buffers().is_missing(&checksum));
    assert!(!server.contains(&checksum));

    ctx.buffers().cache(&checksum, buffer).await;
    assert!(!ctx.buffers().is_missing(&checksum));
    assert!(server.contains(&checksum));
    drop(guard);
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn reads_from_read_folders() -> anyhow::Result<()> {
    setup_logging();
    let dir = testdir::testdir!();
    let buffer = Buffer::from("on disk\n");
    let checksum = buffer.checksum();
    let filename = dir.join(checksum.to_hex());
    std::fs::write(&filename, buffer.bytes())?;
    let corrupt = Checksum::new(b"corrupt\n");
    std::fs::write(dir.join(corrupt.to_hex()), b"not corrupt\n")?;

    let ctx = context(RemoteConfig {
        read_folders: vec![dir.clone()],
        ..Default::default()
    })
    .await?;
    assert_eq!(ctx.get_buffer(&checksum).await?, buffer);
    assert_eq!(ctx.remote().get_filename(&checksum).await, Some(filename));
    assert!(ctx.get_buffer(&corrupt).await.is_err());
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn read_folders_wait_for_lock_files() -> anyhow::Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let buffer = Buffer::from("being written\n");
    let checksum = buffer.checksum();
    let filename = dir.path().join(checksum.to_hex());
    let lock = dir.path().join(format!("{}.LOCK", checksum.to_hex()));
    std::fs::write(&lock, b"")?;

    let ctx = context(RemoteConfig {
        read_folders: vec![dir.path().to_path_buf()],
        lock_timeout: Duration::from_secs(5),
        lock_poll_interval: Duration::from_millis(20),
        ..Default::default()
    })
    .await?;
    let writer = {
        let data = buffer.bytes().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&filename, data).await?;
            tokio::fs::remove_file(&lock).await
        })
    };
    assert_eq!(ctx.get_buffer(&checksum).await?, buffer);
    writer.await??;
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn unreachable_write_server() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let url: Url = format!("http://{addr}/").parse()?;
    let res = context(RemoteConfig {
        write_server: Some(url),
        connect_trials: 2,
        probe_timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .await;
    assert!(res.is_err());
    Ok(())
}
