//! `dynconf inspect`: read-only queries against a running HAProxy.

use crate::cli::{InspectArgs, InspectTarget};
use crate::cmd::connect;
use crate::error::DynconfError;

pub async fn execute(args: &InspectArgs) -> Result<(), DynconfError> {
    let client = connect(&args.socket)?;

    match &args.target {
        InspectTarget::Backends => {
            let backends = client.backends().await?;
            if args.json {
                println!("{}", serde_json::json!({ "backends": backends }));
            } else {
                for name in &backends {
                    println!("{name}");
                }
            }
        }
        InspectTarget::Maps => {
            let maps = client.maps().await?;
            if args.json {
                let maps: Vec<serde_json::Value> = maps
                    .iter()
                    .map(|m| serde_json::json!({ "id": m.id, "path": m.path }))
                    .collect();
                println!("{}", serde_json::json!({ "maps": maps }));
            } else {
                for map in &maps {
                    println!("{:>4}  {}", map.id, map.path);
                }
            }
        }
        InspectTarget::Map { name } => {
            let mut map = client.find_map(name).await?;
            let map_name = map.name().to_string();
            let entries = map.entries().await?;
            if args.json {
                let entries: Vec<serde_json::Value> = entries
                    .iter()
                    .map(|e| serde_json::json!({ "id": e.id, "key": e.key, "value": e.value }))
                    .collect();
                println!("{}", serde_json::json!({ "map": map_name, "entries": entries }));
            } else {
                for entry in entries {
                    println!("{}  {}", entry.key, entry.value);
                }
            }
        }
        InspectTarget::Servers { backend } => {
            let mut backend = client.find_backend(backend).await?;
            let servers = backend.servers().await?;
            if args.json {
                let servers: Vec<serde_json::Value> = servers
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "id": s.id,
                            "name": s.name,
                            "ip": s.ip,
                            "port": s.port,
                            "weight": s.weight,
                            "state": s.state.as_str(),
                            "dynamic": s.is_dynamic(),
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::json!({ "backend": backend.name(), "servers": servers })
                );
            } else {
                for s in &servers {
                    println!(
                        "{:<28} {:>15}:{:<5} weight={:<3} {}",
                        s.name,
                        s.ip,
                        s.port,
                        s.weight,
                        s.state.as_str()
                    );
                }
            }
        }
    }

    Ok(())
}
