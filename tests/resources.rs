use std::fs;
use std::path::PathBuf;

use mt5_translator::mt5::MT5Config;
use mt5_translator::resources::{LocalResource, ResourceProvider};
use mt5_translator::Config;

#[test]
fn local_resource_points_to_its_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    MT5Config::default().to_file(&path)?;

    let resource: Box<dyn ResourceProvider> = Box::new(LocalResource::from(path.clone()));
    assert_eq!(resource.get_local_path()?, path);

    let config = MT5Config::from_file(resource.get_local_path()?)?;
    assert_eq!(config.vocab_size, 250112);
    Ok(())
}

#[test]
fn malformed_config_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("config.json");
    fs::write(&path, "{\"d_model\": ")?;
    assert!(MT5Config::from_file(&path).is_err());
    assert!(MT5Config::from_file(PathBuf::from("missing/config.json")).is_err());
    Ok(())
}

#[test]
#[cfg(feature = "remote")]
#[cfg_attr(not(feature = "all-tests"), ignore)]
fn remote_mt5_small_config_is_downloaded() -> anyhow::Result<()> {
    use mt5_translator::mt5::MT5ConfigResources;
    use mt5_translator::resources::RemoteResource;

    let resource = RemoteResource::from_pretrained(MT5ConfigResources::MT5_SMALL);
    let config = MT5Config::from_file(resource.get_local_path()?)?;
    assert_eq!(config.d_model, 512);
    assert_eq!(config.num_layers, 8);
    Ok(())
}
