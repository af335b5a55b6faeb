#![allow(dead_code)]

pub mod sse;

use anyhow::Context as _;
use std::path::Path;
use std::process::{Child, Command};

pub fn spawn_gateway(config_path: &Path, port: u16) -> anyhow::Result<Child> {
    let bin = env!("CARGO_BIN_EXE_apigate");
    Command::new(bin)
        .arg("--config")
        .arg(config_path)
        .arg("--bind")
        .arg(format!("127.0.0.1:{port}"))
        .arg("--log-level")
        .arg("info")
        .spawn()
        .context("spawn gateway")
}

pub const BIKES_SPEC: &str = r#"
openapi: 3.0.3
info: {title: Bikes, version: "1.0"}
paths:
  /bikes:
    get:
      operationId: listBikes
      responses: {"200": {description: ok}}
    post:
      operationId: Createbike
      requestBody:
        required: true
        content:
          application/json:
            schema:
              type: object
              required: [make]
              properties:
                make: {type: string}
      responses: {"201": {description: created}}
  /{bike_id}:
    get:
      operationId: GetbikeByID
      parameters:
        - {name: bike_id, in: path, required: true, schema: {type: string}}
      responses:
        "200":
          description: ok
          content:
            application/json:
              schema:
                type: object
                properties:
                  id: {type: string}
                  make: {type: string}
"#;

/// Write the bikes document into `dir` and return its path.
pub fn write_bikes_spec(dir: &Path) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join("openapi.yaml");
    std::fs::write(&path, BIKES_SPEC).context("write spec")?;
    Ok(path)
}
