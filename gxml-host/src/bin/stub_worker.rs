//! Minimal render worker speaking the full channel protocol.
//!
//! Stands in for the Python compute engine in integration tests and when
//! poking at the channel by hand: prints the readiness sentinel, reads
//! line-wise requests from stdin, answers backend commands, and frames
//! geometry responses on stdout. A document mentioning `explode` fails the
//! way a bad scene does, `mesh="indexed"` switches the reply to the
//! indexed format, and the `crash` command exits without replying.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use anyhow::Context;
use gxml_wire::{IndexedGeometry, Panel, PanelGeometry};
use serde_json::{Value, json};

const UNIT_QUAD: [[f32; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
];

fn main() -> anyhow::Result<()> {
    let backends = BTreeMap::from([("c".to_string(), true), ("gpu".to_string(), true)]);
    let mut current_backend = "c".to_string();

    announce_ready(&current_backend, &backends);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line.context("reading request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let payload = respond(&line, &mut current_backend, &backends)?;
        write_frame(&mut out, &payload)?;
    }
    Ok(())
}

fn announce_ready(backend: &str, backends: &BTreeMap<String, bool>) {
    let mut line = format!("GXML_WORKER_READY backend={backend}");
    for (name, available) in backends {
        let value = if *available { "True" } else { "False" };
        line.push_str(&format!(" {name}={value}"));
    }
    eprintln!("{line}");
}

fn respond(
    line: &str,
    current_backend: &mut String,
    backends: &BTreeMap<String, bool>,
) -> anyhow::Result<Vec<u8>> {
    if let Ok(request) = serde_json::from_str::<Value>(line)
        && let Some(command) = request.get("command").and_then(Value::as_str)
    {
        return run_command(command, &request, current_backend, backends);
    }
    render(line)
}

fn run_command(
    command: &str,
    request: &Value,
    current_backend: &mut String,
    backends: &BTreeMap<String, bool>,
) -> anyhow::Result<Vec<u8>> {
    let result = match command {
        "get_backend_info" => {
            json!({"backend": current_backend.as_str(), "backends": backends})
        }
        "set_backend" => match request.get("backend").and_then(Value::as_str) {
            Some(name) if backends.get(name).copied().unwrap_or(false) => {
                *current_backend = name.to_string();
                json!({"ok": true, "backend": name})
            }
            Some(name) => json!({"error": format!("unknown backend: {name}")}),
            None => json!({"error": "set_backend requires a backend"}),
        },
        "crash" => {
            // the engine dying mid-request: no reply, nonzero exit
            eprintln!("stub worker: crashing on request");
            std::process::exit(3);
        }
        other => json!({"error": format!("unknown command: {other}")}),
    };
    envelope(&result, &[])
}

fn render(doc: &str) -> anyhow::Result<Vec<u8>> {
    if doc.contains("explode") {
        return envelope(&json!({"error": "render error: explode requested"}), &[]);
    }

    let id = panel_id(doc);
    let geometry = if doc.contains("mesh=\"indexed\"") {
        IndexedGeometry::new(&UNIT_QUAD, &[0, 1, 2, 0, 2, 3], vec![id])
            .encode()
            .context("encoding indexed geometry")?
    } else {
        let panel = Panel::new(id, [0.9, 0.2, 0.3], &UNIT_QUAD)
            .with_endpoints([0.0, 0.5, 0.0], [1.0, 0.5, 0.0]);
        PanelGeometry::new(2, vec![panel])
            .encode()
            .context("encoding panel geometry")?
    };

    let meta = json!({
        "timings": {
            "parse": 0.04,
            "layout": 0.11,
            "geometry": 0.18,
            "serialize": 0.03,
            "total": 0.42
        }
    });
    envelope(&meta, &geometry)
}

/// First `id="..."` attribute in the document, or a fixed fallback.
fn panel_id(doc: &str) -> String {
    doc.find("id=\"")
        .and_then(|at| {
            let rest = &doc[at + 4..];
            rest.find('"').map(|end| rest[..end].to_string())
        })
        .unwrap_or_else(|| "panel-0".to_string())
}

fn envelope(meta: &Value, trailer: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(meta).context("encoding response metadata")?;
    payload.push(b'\n');
    payload.extend_from_slice(trailer);
    Ok(payload)
}

fn write_frame(out: &mut impl Write, payload: &[u8]) -> anyhow::Result<()> {
    out.write_all(&(payload.len() as u32).to_le_bytes())
        .and_then(|_| out.write_all(payload))
        .and_then(|_| out.flush())
        .context("writing response frame")
}
