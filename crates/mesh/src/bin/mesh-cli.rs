//! Mesh CLI Tool
//!
//! Offline inspection of a device topology: connection graph, best route
//! and alternates between two devices, and per-device reachability.
//!
//! The topology file is a JSON array of device records as persisted by a node.

use anyhow::{bail, Context, Result};
use hybridmesh_core::{logging, Device};
use hybridmesh_mesh::{Route, RoutingSnapshot};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

/// JSON output for the route command
#[derive(Debug, Serialize)]
struct RouteOutput<'a> {
    from: &'a str,
    to: &'a str,
    best: Option<&'a Route>,
    alternates: &'a [Route],
}

fn load_topology(path: &Path) -> Result<RoutingSnapshot> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology {}", path.display()))?;
    let devices: Vec<Device> =
        serde_json::from_str(&content).context("Topology is not a JSON array of devices")?;
    if devices.is_empty() {
        bail!("No devices found in topology file");
    }
    Ok(RoutingSnapshot::build(&devices))
}

fn cmd_graph(topology: PathBuf, json: bool) -> Result<()> {
    let snapshot = load_topology(&topology)?;

    if json {
        println!("{}", serde_json::to_string_pretty(snapshot.connections())?);
        return Ok(());
    }

    println!("Devices: {}", snapshot.devices().count());
    println!("Connections: {}", snapshot.connections().len());
    for connection in snapshot.connections() {
        println!(
            "  {} -> {} via {} (signal {} dBm, cost {}{})",
            connection.from,
            connection.to,
            connection.transport,
            connection.signal_strength,
            connection.cost,
            if connection.is_active { "" } else { ", inactive" }
        );
    }
    Ok(())
}

fn cmd_route(topology: PathBuf, from: String, to: String, max_routes: usize, json: bool) -> Result<()> {
    let snapshot = load_topology(&topology)?;
    for id in [&from, &to] {
        if snapshot.device(id).is_none() {
            bail!("Unknown device: {}", id);
        }
    }

    let best = snapshot.find_best_route(&from, &to);
    let routes = snapshot.find_alternate_routes(&from, &to, max_routes);
    // The best route is always first among the alternates.
    let alternates = routes.get(1..).unwrap_or_default();

    if json {
        let output = RouteOutput {
            from: &from,
            to: &to,
            best: best.as_ref(),
            alternates,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    match &best {
        Some(route) => {
            println!("Best route:");
            print_route(route);
        }
        None => println!("No route from {} to {}", from, to),
    }
    for (i, route) in alternates.iter().enumerate() {
        println!("Alternate {}:", i + 1);
        print_route(route);
    }
    Ok(())
}

fn print_route(route: &Route) {
    let mut path = vec![route.source.as_str()];
    path.extend(route.hops.iter().map(|h| h.device_id.as_str()));
    println!("  Path: {}", path.join(" -> "));
    println!("  Total cost: {}", route.total_cost);
    println!("  Estimated delivery: {} ms", route.estimated_delivery_ms);
    println!("  Reliability: {:.2}", route.reliability);
    for hop in &route.hops {
        println!(
            "    {} via {} (cost {}, link cost {})",
            hop.device_id, hop.transport, hop.cost, hop.link_cost
        );
    }
}

fn cmd_reach(topology: PathBuf, json: bool) -> Result<()> {
    let snapshot = load_topology(&topology)?;
    let reachability = snapshot.reachability();

    if json {
        println!("{}", serde_json::to_string_pretty(&reachability)?);
        return Ok(());
    }

    for (device, neighbors) in &reachability {
        if neighbors.is_empty() {
            println!("{}: (isolated)", device);
        } else {
            println!("{}: {}", device, neighbors.join(", "));
        }
    }
    Ok(())
}

fn parse_args() -> Result<(String, Vec<String>), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    Ok((args[1].clone(), args[2..].to_vec()))
}

fn print_usage() {
    println!("Mesh CLI - HybridMesh topology inspection");
    println!();
    println!("USAGE:");
    println!("    mesh-cli <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    graph    Print the connection graph");
    println!("    route    Print the best route and alternates between two devices");
    println!("    reach    Print directly connected peers per device");
    println!();
    println!("OPTIONS:");
    println!("    -t, --topology <FILE>    JSON array of devices");
    println!("    -f, --from <ID>          Source device (route)");
    println!("    -d, --to <ID>            Destination device (route)");
    println!("    -m, --max <N>            Maximum routes including the best (route, default 3)");
    println!("        --json               Emit JSON");
}

#[derive(Debug, Default)]
struct Options {
    topology: Option<PathBuf>,
    from: Option<String>,
    to: Option<String>,
    max_routes: Option<usize>,
    json: bool,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--json" => options.json = true,
            "--topology" | "-t" | "--from" | "-f" | "--to" | "-d" | "--max" | "-m" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    bail!("Missing value for {}", flag);
                };
                match flag {
                    "--topology" | "-t" => options.topology = Some(PathBuf::from(value)),
                    "--from" | "-f" => options.from = Some(value.clone()),
                    "--to" | "-d" => options.to = Some(value.clone()),
                    _ => {
                        options.max_routes = Some(
                            value
                                .parse()
                                .with_context(|| format!("Invalid route count: {}", value))?,
                        )
                    }
                }
            }
            other => bail!("Unknown option: {}", other),
        }
        i += 1;
    }
    Ok(options)
}

fn run(command: &str, args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let topology = options
        .topology
        .context("Missing --topology argument")?;

    match command {
        "graph" => cmd_graph(topology, options.json),
        "reach" => cmd_reach(topology, options.json),
        "route" => {
            let from = options.from.context("Missing --from argument")?;
            let to = options.to.context("Missing --to argument")?;
            cmd_route(topology, from, to, options.max_routes.unwrap_or(3), options.json)
        }
        other => bail!("Unknown command: {}", other),
    }
}

fn main() {
    logging::init_with_filter("warn");

    let (command, args) = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            println!();
            print_usage();
            process::exit(1);
        }
    };

    if matches!(command.as_str(), "help" | "--help" | "-h") {
        print_usage();
        return;
    }

    if let Err(e) = run(&command, &args) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
