use crate::consts::APP_NAME;
use std::path::PathBuf;

/// Returns the user's home directory
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/"))
}

/// Returns the directory for data files for the application
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the directory for cache files for the application
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Root of the content-addressed cache store.
///
/// `STRATA_STORE` overrides the default `<cache_dir>/store`.
pub fn store_dir() -> PathBuf {
  if let Ok(path) = std::env::var("STRATA_STORE") {
    return PathBuf::from(path);
  }
  cache_dir().join("store")
}

/// Directory searched by the directory-backed base image provider.
///
/// `STRATA_IMAGES` overrides the default `<data_dir>/images`.
pub fn images_dir() -> PathBuf {
  if let Ok(path) = std::env::var("STRATA_IMAGES") {
    return PathBuf::from(path);
  }
  data_dir().join("images")
}
