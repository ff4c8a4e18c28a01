use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use config::{IpamConfig, wire};
use serde::de::DeserializeOwned;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, version, about, long_about = None)]
/// Cli tool for parsing config & JSON schema
pub struct Args {
    /// path to ipam config. We will determine format from extension. If no extension, we will attempt JSON & YAML
    #[clap(short = 'p', long, value_parser)]
    pub path: PathBuf,
    /// print the parsed wire format or the ipam internal config format
    #[clap(short = 'f', long, value_enum)]
    pub format: Option<Format>,
    /// path to JSON schema, validated against the config whatever its format
    #[clap(short = 's', long, value_parser)]
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Wire,
    Internal,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("found config at path = {}", args.path.display());

    parse_schema(&args)?;
    // always validate, a config that parses but fails here won't start
    let cfg = IpamConfig::from_wire(parse_wire::<wire::Config>(&args.path)?)?;
    println!("{}", summary(&cfg));

    if let Some(format) = &args.format {
        match format {
            Format::Wire => {
                println!("printing wire format");
                println!("{:#?}", cfg.wire());
            }
            Format::Internal => {
                println!("parsed wire format into ipam internal format, pretty printing");
                println!("{:#?}", cfg);
            }
        }
    }

    Ok(())
}

fn summary(cfg: &IpamConfig) -> String {
    let space = cfg.address_space();
    let lease_time = cfg.lease_time();
    format!(
        "network {name}: subnet {subnet}, range {start} - {end}, gateway {gw}, {size} allocatable addresses\n\
         lease time: default {default:?}, min {min:?}, max {max:?}\n\
         store: {backend:?}",
        name = cfg.network_name(),
        subnet = space.subnet(),
        start = space.range_start(),
        end = space.range_end(),
        gw = space.gateway(),
        size = space.allocatable_size(),
        default = lease_time.get_default(),
        min = lease_time.get_min(),
        max = lease_time.get_max(),
        backend = cfg.backend_mode(),
    )
}

fn parse_schema(args: &Args) -> Result<()> {
    if let Some(schema) = &args.schema {
        let parsed = serde_json::from_str::<serde_json::Value>(
            &std::fs::read_to_string(schema).context("failed to find schema")?,
        )?;
        let input = parse_wire::<serde_json::Value>(&args.path)?;
        validate_schema(&parsed, &input)?;
        println!("json schema validated");
    }
    Ok(())
}

fn validate_schema(schema: &serde_json::Value, input: &serde_json::Value) -> Result<()> {
    let validator = jsonschema::JSONSchema::options()
        .with_draft(jsonschema::Draft::Draft7)
        .compile(schema)
        // the compile error borrows the schema, keep only its message
        .map_err(|err| anyhow::anyhow!("failed to compile schema: {err}"))?;
    if let Err(errs) = validator.validate(input) {
        errs.for_each(|err| eprintln!("{}", err));
        return Err(anyhow::anyhow!("failed to validate schema"));
    }
    Ok(())
}

fn parse_wire<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let input = std::fs::read_to_string(path).context("failed to find config")?;

    Ok(match path.extension() {
        Some(ext) if ext == "json" => serde_json::from_str(&input)?,
        Some(ext) if ext == "yaml" || ext == "yml" => serde_yaml::from_str(&input)?,
        _ => match serde_json::from_str(&input) {
            Ok(r) => r,
            Err(_err) => {
                println!("failed parsing from json, trying yaml");
                serde_yaml::from_str(&input)?
            }
        },
    })
}
