// Copyright 2024 Photon Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use http::Method;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use hostel_gateway::{
    handler_fn, Gateway, GatewayConfig, GatewayRequest, GatewayResponse, RequiredFields,
    RouteOptions, WeakGateway,
};

/// Hostel Gateway - dispatches JSON-lines requests read from stdin
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path; built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Register the sample hostel routes
    #[arg(long)]
    demo_routes: bool,
}

/// One request line on stdin
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    /// Echoed back on the response line
    #[serde(default)]
    id: Value,
    method: String,
    path: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    client_id: Option<String>,
}

impl WireRequest {
    fn into_request(self) -> Result<GatewayRequest> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| anyhow!("Invalid method '{}': {}", self.method, e))?;

        let mut request = GatewayRequest::new(method, self.path);
        for (name, value) in &self.headers {
            request = request.with_header(name, value)?;
        }
        for (name, value) in self.query {
            request = request.with_query(name, value);
        }
        if let Some(body) = self.body {
            request = request.with_body(body);
        }
        if let Some(client_id) = self.client_id {
            request = request.with_client(client_id);
        }
        Ok(request)
    }
}

/// One response line on stdout
#[derive(Debug, Serialize)]
struct WireResponse {
    id: Value,
    status: u16,
    headers: BTreeMap<String, String>,
    body: Value,
}

impl WireResponse {
    fn new(id: Value, response: &GatewayResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            id,
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
        }
    }

    fn malformed(reason: &str) -> Self {
        Self {
            id: Value::Null,
            status: 400,
            headers: BTreeMap::new(),
            body: json!({"error": "malformed_request", "message": reason}),
        }
    }
}

/// Upgrade the weak handle inside an introspection handler
fn live(gateway: &WeakGateway) -> Result<Gateway> {
    gateway
        .upgrade()
        .ok_or_else(|| anyhow!("gateway is shutting down"))
}

fn register_admin_routes(gateway: &Gateway) {
    let weak = gateway.downgrade();
    gateway.register_route(
        Method::GET,
        "/health",
        handler_fn(move |_req| {
            let weak = weak.clone();
            async move { Ok(serde_json::to_value(live(&weak)?.health_check())?) }
        }),
        RouteOptions::new().description("Gateway health"),
    );

    let weak = gateway.downgrade();
    gateway.register_route(
        Method::GET,
        "/metrics",
        handler_fn(move |req| {
            let weak = weak.clone();
            async move {
                let gateway = live(&weak)?;
                let route = req
                    .query
                    .iter()
                    .find(|(name, _)| name == "route")
                    .map(|(_, value)| value.as_str());
                if req.query.iter().any(|(name, value)| name == "format" && value == "prometheus") {
                    return Ok(Value::String(gateway.export_metrics()?));
                }
                Ok(serde_json::to_value(gateway.get_metrics(route))?)
            }
        }),
        RouteOptions::new().description("Per-route metrics"),
    );

    let weak = gateway.downgrade();
    gateway.register_route(
        Method::GET,
        "/routes",
        handler_fn(move |_req| {
            let weak = weak.clone();
            async move { Ok(serde_json::to_value(live(&weak)?.get_routes())?) }
        }),
        RouteOptions::new().description("Registered routes"),
    );
}

fn register_demo_routes(gateway: &Gateway) {
    gateway.register_route(
        Method::GET,
        "/items",
        handler_fn(|_req| async {
            Ok(json!([
                {"sku": "towel", "price": 3},
                {"sku": "padlock", "price": 5},
            ]))
        }),
        RouteOptions::new()
            .cacheable(Duration::from_secs(2))
            .rate_limit(3, Duration::from_secs(1))
            .description("Front desk shop items"),
    );

    gateway.register_route(
        Method::POST,
        "/vouchers",
        handler_fn(|req| async move {
            let guest = req
                .context
                .claims
                .as_ref()
                .and_then(|claims| claims.subject.clone())
                .unwrap_or_default();
            Ok(json!({"issuedBy": guest, "voucher": req.body}))
        }),
        RouteOptions::new()
            .requires_auth()
            .roles(["staff", "admin"])
            .validator(RequiredFields::new(["guest", "amount"]))
            .description("Issue a meal voucher"),
    );
}

/// Collect request tasks that have already finished
fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.try_join_next() {
        if let Err(e) = result {
            error!("Request task failed: {}", e);
        }
    }
}

async fn run(gateway: Gateway) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WireResponse>();

    // Single writer keeps response lines whole
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        reap_finished(&mut in_flight);
        if line.trim().is_empty() {
            continue;
        }

        let wire: WireRequest = match serde_json::from_str(&line) {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Skipping malformed request line: {}", e);
                let _ = tx.send(WireResponse::malformed(&e.to_string()));
                continue;
            }
        };

        let id = wire.id.clone();
        let request = match wire.into_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping invalid request: {}", e);
                let mut malformed = WireResponse::malformed(&e.to_string());
                malformed.id = id;
                let _ = tx.send(malformed);
                continue;
            }
        };

        let gateway = gateway.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = gateway.handle(request).await;
            let _ = tx.send(WireResponse::new(id, &response));
        });
    }

    while let Some(result) = in_flight.join_next().await {
        if let Err(e) = result {
            error!("Request task failed: {}", e);
        }
    }
    drop(tx);
    writer.await??;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .target(env_logger::Target::Stderr)
        .init();

    info!("Starting Hostel Gateway...");

    // Load configuration
    let config = match &args.config {
        Some(path) => match GatewayConfig::from_file(path) {
            Ok(config) => {
                info!("Configuration loaded successfully from {}", path);
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                return Err(e);
            }
        },
        None => GatewayConfig::default(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let gateway = Gateway::new(config)?;
        register_admin_routes(&gateway);
        if args.demo_routes {
            register_demo_routes(&gateway);
        }
        let maintenance = gateway.spawn_maintenance(gateway.config().maintenance_interval);

        info!(
            "Hostel Gateway ready with {} routes, reading requests from stdin",
            gateway.get_routes().len()
        );

        let result = run(gateway).await;
        maintenance.abort();
        result
    })
}
