use std::env;
use std::path::{PathBuf, Path};

use anyhow::{Context, Result};

use podlink_config::DrillConfig;

const CONFIG_ENV: &str = "PODLINK_JSON_CONFIG";

fn json_config(out: &Path) -> Result<()> {
    DrillConfig::schema_to_file(&out.join("schema.json"))
        .context("While generating JSON schema")?;

    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_JSON_CONFIG");
    println!("cargo:rerun-if-env-changed={}", CONFIG_ENV);
    let path = env::var_os(CONFIG_ENV)
        .map(|s| s.into_string())
        .transpose()
        .map_err(|_| anyhow::anyhow!("{} is not utf-8", CONFIG_ENV))?;

    if env::var_os("CARGO_FEATURE_JSON_CONFIG").is_none() {
        if path.is_some() {
            println!("cargo:warning={} defined but ignored because feature \"json-config\" is not enabled", CONFIG_ENV);
        }
        return Ok(());
    }

    let path = path.unwrap_or_else(|| String::from("podlink.json"));
    println!("cargo:rerun-if-changed={}", path);

    let config = DrillConfig::from_file(Path::new(&path))
        .context(format!("While reading {}", path))?;
    config.to_file(&out.join("config.rs"))
        .context(format!("While generating config.rs from {}", path))?;

    Ok(())
}

fn main() -> Result<()> {
    built::write_built_file()?;
    let out = PathBuf::from(env::var_os("OUT_DIR").context("Could not get OUT_DIR")?);
    json_config(&out)?;
    Ok(())
}
