use anyhow::Result;
use serde_json::json;

use strata_lib::execute::SandboxMode;
use strata_lib::platform::paths::{images_dir, store_dir};
use strata_lib::platform::platform_triple;

use crate::output::{OutputFormat, print_json, print_stat};

pub fn cmd_info(output: OutputFormat) -> Result<()> {
  let platform = platform_triple();
  let store = store_dir();
  let images = images_dir();
  let sandbox = SandboxMode::detect();

  if output.is_json() {
    return print_json(&json!({
      "platform": platform,
      "store": store,
      "images": images,
      "sandbox": sandbox,
    }));
  }

  println!("System:");
  match platform {
    Some(triple) => print_stat("Platform", &triple),
    None => print_stat("Platform", "unsupported"),
  }
  print_stat("Store", &store.display().to_string());
  print_stat("Images", &images.display().to_string());
  print_stat("Sandbox", sandbox.as_str());
  Ok(())
}
