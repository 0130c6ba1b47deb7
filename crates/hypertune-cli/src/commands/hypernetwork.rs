//! Hypernetwork management commands

use std::path::{Path, PathBuf};

use candle_core::Device;
use hypertune_net::Hypernetwork;
use hypertune_registry::HypernetworkRegistry;
use tracing::info;

type CommandResult<T> = Result<T, Box<dyn std::error::Error>>;

pub fn list(registry: &HypernetworkRegistry) {
    println!("Hypernetwork directory: {}", registry.root().display());
    println!();

    if registry.is_empty() {
        println!("No hypernetworks found.");
        return;
    }

    println!("Found {} hypernetwork(s):", registry.len());
    for (name, path) in registry.list() {
        println!("  - {:<24} {}", name, path.display());
    }
}

pub fn info(registry: &HypernetworkRegistry, name: &str) -> CommandResult<()> {
    let Some(path) = lookup(registry, name) else {
        println!("Hypernetwork '{}' not found.", name);
        println!("Use 'hypertune list' to see available hypernetworks.");
        return Ok(());
    };

    let hypernetwork = Hypernetwork::from_file(path, &Device::Cpu)?;

    println!("Hypernetwork: {}", hypernetwork.name());
    println!("==============================");
    println!("Path:       {}", path.display());
    println!("Hash:       {}", file_hash(path)?);
    println!("Step:       {}", hypernetwork.step);
    println!("Parameters: {}", hypernetwork.parameter_count());
    println!();
    println!("Trained against:");
    println!(
        "  Checkpoint: {}",
        hypernetwork.sd_checkpoint_name.as_deref().unwrap_or("unknown")
    );
    println!(
        "  Hash:       {}",
        hypernetwork.sd_checkpoint.as_deref().unwrap_or("unknown")
    );
    println!();
    println!("Layers:");
    for (dim, pair) in hypernetwork.layers() {
        println!(
            "  {:>5}  k {:?}  v {:?}",
            dim,
            pair.key.shape().multipliers(),
            pair.value.shape().multipliers()
        );
    }

    Ok(())
}

pub fn create(
    registry: &HypernetworkRegistry,
    name: &str,
    sizes: &[usize],
    multipliers: Option<&[f64]>,
    overwrite: bool,
) -> CommandResult<()> {
    let path = create_file(registry, name, sizes, multipliers, overwrite)?;
    println!("Created hypernetwork at {}", path.display());
    Ok(())
}

pub fn find(registry: &HypernetworkRegistry, term: &str) {
    match registry.find_closest_name(term) {
        Some(name) => println!("{}", name),
        None => println!("No hypernetwork matches '{}'.", term),
    }
}

/// Exact name, falling back to the closest match
fn lookup<'a>(registry: &'a HypernetworkRegistry, name: &str) -> Option<&'a Path> {
    if let Some(path) = registry.get(name) {
        return Some(path);
    }

    let closest = registry.find_closest_name(name)?;
    println!("Using closest match '{}'", closest);
    registry.get(closest)
}

fn create_file(
    registry: &HypernetworkRegistry,
    name: &str,
    sizes: &[usize],
    multipliers: Option<&[f64]>,
    overwrite: bool,
) -> CommandResult<PathBuf> {
    let name = sanitize_name(name);
    if name.is_empty() {
        return Err("hypernetwork name is empty".into());
    }
    if sizes.is_empty() {
        return Err("at least one size is required".into());
    }

    let path = registry.output_path(&name);
    if path.exists() && !overwrite {
        let message = format!(
            "{} already exists, pass --overwrite to replace it",
            path.display()
        );
        return Err(message.into());
    }

    let hypernetwork = Hypernetwork::with_sizes(name.as_str(), sizes, multipliers, &Device::Cpu)?;
    std::fs::create_dir_all(registry.root())?;
    hypernetwork.save(&path)?;

    info!(
        name = %name,
        sizes = ?sizes,
        parameters = hypernetwork.parameter_count(),
        "Created hypernetwork"
    );
    Ok(path)
}

/// Keep only characters safe in a file name
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || "._- ".contains(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn file_hash(path: &Path) -> CommandResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypertune_net::DEEP_MULTIPLIERS;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("anime v2"), "anime v2");
        assert_eq!(sanitize_name("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_name("  /  "), "");
    }

    #[test]
    fn test_create_uses_deep_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = HypernetworkRegistry::open(temp_dir.path().join("hn"));

        let path = create_file(&registry, "anime", &[320, 768], None, false).unwrap();
        registry.scan();

        assert_eq!(registry.get("anime"), Some(path.as_path()));
        let hypernetwork = Hypernetwork::from_file(&path, &Device::Cpu).unwrap();
        assert_eq!(hypernetwork.dims(), vec![320, 768]);
        assert_eq!(hypernetwork.step, 0);
        assert_eq!(
            hypernetwork.blocks(320).unwrap().key.shape().multipliers(),
            &DEEP_MULTIPLIERS
        );
    }

    #[test]
    fn test_create_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let registry = HypernetworkRegistry::open(temp_dir.path());

        create_file(&registry, "anime", &[8], Some(&[1.0, 2.0, 1.0]), false).unwrap();
        assert!(create_file(&registry, "anime", &[8], None, false).is_err());
        assert!(create_file(&registry, "anime", &[8], None, true).is_ok());
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let temp_dir = TempDir::new().unwrap();
        let registry = HypernetworkRegistry::open(temp_dir.path());

        assert!(create_file(&registry, "//", &[8], None, false).is_err());
        assert!(create_file(&registry, "anime", &[], None, false).is_err());
        assert!(create_file(&registry, "anime", &[8], Some(&[2.0, 1.0]), false).is_err());
    }

    #[test]
    fn test_lookup_falls_back_to_closest() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = HypernetworkRegistry::open(temp_dir.path());
        create_file(&registry, "anime_style", &[8], None, false).unwrap();
        registry.scan();

        assert!(lookup(&registry, "anime_style").is_some());
        assert!(lookup(&registry, "ANIME").is_some());
        assert!(lookup(&registry, "photo").is_none());
    }

    #[test]
    fn test_file_hash_is_stable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        std::fs::write(&path, b"hypernetwork").unwrap();

        let hash = file_hash(&path).unwrap();
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, file_hash(&path).unwrap());
    }
}
