use std::sync::Arc;

use anyhow::Context as _;
use cellstore::{
    database::{Database, DatabaseError, SemKey},
    deep_structure::PathItem,
    expression::Expression,
    transformation_cache::{Pin, RunOptions, UndoOutcome},
    value::Value,
    Buffer, Celltype, Checksum, Config, Context, Error, Transformation,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;

mod common;

use common::{setup_logging, DatabaseServer, Increment};

async fn context(url: &Url, executor: Arc<Increment>) -> anyhow::Result<Context> {
    let config = Config {
        database: Some(url.clone()),
        ..Default::default()
    };
    let database = Database::connect(url.clone(), 3).await?;
    Ok(Context::builder()
        .config(config)
        .database(database)
        .executor(executor)
        .build())
}

fn increment_of(input: Checksum) -> Transformation {
    Transformation::default()
        .with_pin("a", Pin::new(Celltype::Plain, input))
        .with_language("python")
}

#[tokio::test]
async fn results_and_metadata_are_stored() -> anyhow::Result<()> {
    setup_logging();
    let server = DatabaseServer::default();
    let url = server.spawn().await?;
    let executor = Arc::new(Increment::default());

    let first = context(&url, executor.clone()).await?;
    let input = first
        .converter()
        .store(&Value::Json(json!(1)), Celltype::Plain)
        .await?;
    let tf = increment_of(input);
    let result = first.run_transformation(&tf, RunOptions::default()).await?;
    assert_eq!(result, Checksum::new(b"2\n"));
    assert_eq!(
        server.get(json!({"type": "transformation", "checksum": tf.checksum()})),
        Some(json!(result))
    );
    let metadata = first
        .database()
        .get_metadata(&tf.checksum())
        .await?
        .context("no metadata")?;
    assert_eq!(metadata["Success"], json!(true));
    assert_eq!(metadata["Executor"], json!("increment"));
    assert!(metadata["Time"].is_string());
    first.destroy();

    // a fresh context knows the result without running anything
    let second = context(&url, executor.clone()).await?;
    assert_eq!(
        second
            .transformations()
            .get_transformation_result(&tf.checksum())
            .await,
        Some((result, false))
    );
    assert_eq!(second.run_transformation(&tf, RunOptions::default()).await?, result);
    assert_eq!(executor.runs(), 1);
    second.destroy();
    Ok(())
}

#[tokio::test]
async fn fingertip_mines_reverse_transformations() -> anyhow::Result<()> {
    setup_logging();
    let server = DatabaseServer::default();
    let url = server.spawn().await?;
    let executor = Arc::new(Increment::default());

    let first = context(&url, executor.clone()).await?;
    let input = first
        .converter()
        .store(&Value::Json(json!(10)), Celltype::Plain)
        .await?;
    let tf = increment_of(input);
    let result = first.run_transformation(&tf, RunOptions::default()).await?;
    first.destroy();
    server.insert(
        json!({"type": "rev_transformations", "checksum": result}),
        json!([tf.checksum()]),
    );

    // the second context has the inputs, but no local provenance for the result
    let second = context(&url, executor.clone()).await?;
    second
        .buffers()
        .cache(&input, Buffer::from("10\n"))
        .await;
    second
        .buffers()
        .cache(&tf.checksum(), tf.to_buffer())
        .await;
    assert!(second.buffers().get_local(&result).is_none());
    let buffer = second.get_buffer(&result).await?;
    assert_eq!(buffer, Buffer::from("11\n"));
    assert_eq!(executor.runs(), 2);
    second.destroy();
    Ok(())
}

#[tokio::test]
async fn fingertip_mines_reverse_expressions() -> anyhow::Result<()> {
    setup_logging();
    let server = DatabaseServer::default();
    let url = server.spawn().await?;
    let ctx = context(&url, Arc::new(Increment::default())).await?;
    let source = ctx
        .converter()
        .store(&Value::Json(json!({"x": "y"})), Celltype::Plain)
        .await?;
    let result = Checksum::new(b"\"y\"\n");
    server.insert(
        json!({"type": "rev_expression", "checksum": result}),
        json!([{
            "checksum": source,
            "celltype": "plain",
            "path": ["x"],
            "target_celltype": "plain",
            "result": result,
        }]),
    );
    let buffer = ctx.get_buffer(&result).await?;
    assert_eq!(buffer, Buffer::from("\"y\"\n"));
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn expression_results_are_shared() -> anyhow::Result<()> {
    setup_logging();
    let server = DatabaseServer::default();
    let url = server.spawn().await?;

    let first = context(&url, Arc::new(Increment::default())).await?;
    let source = first
        .converter()
        .store(&Value::Json(json!({"x": [1, 2, 3]})), Celltype::Plain)
        .await?;
    let expression = Expression::new(
        source,
        vec![PathItem::Key("x".into())],
        Celltype::Plain,
        Celltype::Plain,
        None,
        None,
        None,
    )?;
    let result = first
        .evaluate_expression(&expression, false)
        .await?
        .context("no result")?;
    assert_eq!(server.count("expression"), 1);
    first.destroy();

    let second = context(&url, Arc::new(Increment::default())).await?;
    assert_eq!(second.evaluate_expression(&expression, false).await?, Some(result));
    assert!(second.buffers().get_local(&source).is_none());
    // recomputing needs the source buffer
    let err = second
        .evaluate_expression(&expression, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CacheMiss(_)), "{err:?}");
    second.destroy();
    Ok(())
}

#[tokio::test]
async fn undo_contests_results() -> anyhow::Result<()> {
    setup_logging();
    let server = DatabaseServer::default();
    let url = server.spawn().await?;
    let executor = Arc::new(Increment::default());
    let ctx = context(&url, executor.clone()).await?;
    let input = ctx
        .converter()
        .store(&Value::Json(json!(5)), Celltype::Plain)
        .await?;
    let tf = increment_of(input);
    let tf_checksum = tf.checksum();
    let result = ctx.run_transformation(&tf, RunOptions::default()).await?;

    let tcache = ctx.transformations();
    assert_eq!(tcache.undo(&tf_checksum).await?, UndoOutcome::Withdrawn(result));
    let contests = server.contests();
    assert_eq!(contests.len(), 1);
    assert_eq!(contests[0]["result"], json!(result));
    assert_eq!(tcache.get_transformation_result(&tf_checksum).await, None);

    assert_eq!(ctx.run_transformation(&tf, RunOptions::default()).await?, result);
    assert_eq!(executor.runs(), 2);
    server.refuse_contests(true);
    assert_eq!(
        tcache.undo(&tf_checksum).await?,
        UndoOutcome::Refused("Result confirmed by others".into())
    );
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn semantic_mappings_are_shared() -> anyhow::Result<()> {
    setup_logging();
    let server = DatabaseServer::default();
    let url = server.spawn().await?;

    let first = context(&url, Arc::new(Increment::default())).await?;
    let code = Buffer::from("def f():\n\n    return 1   \n");
    let syntactic = code.checksum();
    first.buffers().cache(&syntactic, code).await;
    let semantic = first
        .transformations()
        .syntactic_to_semantic(&syntactic, Celltype::Python, None, "f")
        .await?;
    assert_ne!(semantic, syntactic);
    assert_eq!(server.count("semantic_to_syntactic"), 1);
    first.destroy();

    let second = context(&url, Arc::new(Increment::default())).await?;
    let key = SemKey::new(semantic, Celltype::Python, None);
    assert_eq!(
        second.transformations().semantic_to_syntactic(&key).await,
        Some(vec![syntactic])
    );
    second.destroy();
    Ok(())
}

#[tokio::test]
async fn from_config_connects() -> anyhow::Result<()> {
    let server = DatabaseServer::default();
    let url = server.spawn().await?;
    let config = Config {
        database: Some(url.clone()),
        ..Default::default()
    };
    let ctx = Context::from_config(config).await?;
    assert!(ctx.database().is_active());
    assert_eq!(ctx.database().url(), Some(url));
    ctx.destroy();
    Ok(())
}

#[tokio::test]
async fn unreachable_database() -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let url: Url = format!("http://{addr}/").parse()?;
    let err = Database::connect(url.clone(), 2).await.unwrap_err();
    assert!(matches!(&err, DatabaseError::Connect(u) if *u == url), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn protocol_mismatch() -> anyhow::Result<()> {
    let app = axum::Router::new().route(
        "/",
        axum::routing::get(|| async { axum::Json(json!(["seamless", "database", "0.1"])) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, app).await });
    let url: Url = format!("http://{addr}/").parse()?;
    let err = Database::connect(url, 1).await.unwrap_err();
    assert!(matches!(err, DatabaseError::Protocol), "{err:?}");
    Ok(())
}
