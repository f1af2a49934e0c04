//! A trivial JSON-RPC server exporting arithmetic over TCP with line
//! framing.
//!
//! Run it, then try the companion client:
//!
//! ```text
//! cargo run --example adder-server -- 127.0.0.1:8080
//! cargo run --example math-client -- 127.0.0.1:8080
//! ```
//!
//! Or talk to it by hand:
//!
//! ```text
//! {"jsonrpc":"2.0","id":1,"method":"Add","params":[1,2,3]}
//! {"jsonrpc":"2.0","id":2,"method":"rpc.serverInfo"}
//! ```

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use tandem::{method, serve, Assigner, Framing, LoopOptions, MapAssigner, RpcError, ServiceMap};

#[derive(Deserialize)]
struct BinArg {
    #[serde(rename = "X")]
    x: f64,
    #[serde(rename = "Y")]
    y: f64,
}

fn math() -> MapAssigner {
    MapAssigner::new()
        .with(
            "Add",
            method(|_ctx, values: Vec<i64>| async move {
                Ok::<_, RpcError>(values.iter().sum::<i64>())
            }),
        )
        .with(
            "Mul",
            method(|_ctx, values: Vec<i64>| async move {
                Ok::<_, RpcError>(values.iter().product::<i64>())
            }),
        )
        .with(
            "Div",
            method(|_ctx, arg: BinArg| async move {
                if arg.y == 0.0 {
                    return Err(RpcError::invalid_params("zero divisor"));
                }
                Ok(arg.x / arg.y)
            }),
        )
        .with(
            "Status",
            method(|_ctx, _params: Option<Value>| async { Ok("all systems go") }),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    let assigner: Arc<dyn Assigner> = Arc::new(
        ServiceMap::new()
            .with("Math", math())
            .with(
                "Post",
                MapAssigner::new().with(
                    "Alert",
                    method(|_ctx, params: Value| async move {
                        info!(alert = %params, "received alert");
                        Ok(Value::Null)
                    }),
                ),
            ),
    );

    serve(
        listener,
        assigner,
        LoopOptions {
            framing: Framing::Line,
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}
