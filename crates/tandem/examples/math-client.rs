//! A JSON-RPC client exercising the adder-server example: single calls, an
//! error case, a batch, and a notification.
//!
//! ```text
//! cargo run --example math-client -- 127.0.0.1:8080
//! ```

use serde_json::json;
use tokio::net::TcpStream;
use tracing::info;

use tandem::{Client, ClientOptions, Context, Framing, Spec};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let stream = TcpStream::connect(&addr).await?;
    info!(%addr, "connected");

    let (reader, writer) = stream.into_split();
    let client = Client::new(
        Framing::Line.channel(reader, writer),
        ClientOptions {
            on_notify: Some(std::sync::Arc::new(|req| {
                info!(method = %req.method, params = ?req.params, "server push");
            })),
            ..Default::default()
        },
    );
    let ctx = Context::new();

    info!("-- sending a notification");
    client
        .notify(&ctx, "Post.Alert", Some(json!({"message": "there is a fire!"})))
        .await?;

    info!("-- sending individual requests");
    let sum: i64 = client
        .call(&ctx, "Math.Add", Some(json!([1, 3, 5, 7])))
        .await?
        .decode()?;
    info!(sum, "Math.Add");

    let quot: f64 = client
        .call(&ctx, "Math.Div", Some(json!({"X": 82.0, "Y": 19.0})))
        .await?
        .decode()?;
    info!(quot, "Math.Div");

    let status: String = client.call(&ctx, "Math.Status", None).await?.decode()?;
    info!(%status, "Math.Status");

    // An error condition: division by zero.
    match client
        .call(&ctx, "Math.Div", Some(json!({"X": 15.0, "Y": 0.0})))
        .await
    {
        Ok(rsp) => anyhow::bail!("Math.Div unexpectedly succeeded: {:?}", rsp.payload),
        Err(err) => info!(%err, "Math.Div failed as expected"),
    }

    info!("-- sending a batch");
    let specs: Vec<Spec> = (1..=5)
        .map(|i| Spec::call("Math.Mul", Some(json!([i, i + 1]))))
        .collect();
    let responses = client.batch(&ctx, specs).await?;
    for rsp in &responses {
        match rsp.result() {
            Ok(value) => info!(id = %rsp.id().map(ToString::to_string).unwrap_or_default(), %value, "batch result"),
            Err(err) => info!(%err, "batch member failed"),
        }
    }

    client.close().await;
    Ok(())
}
