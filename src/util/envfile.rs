use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use anyhow::Result;

/// Parse a `.env` file in the working directory into a map. Missing file is
/// not an error; malformed lines are skipped.
pub fn parse_env_file() -> Option<HashMap<String, String>> {
    let text = std::fs::read_to_string(".env").ok()?;
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let key = k.trim();
            if key.is_empty() {
                continue;
            }
            map.insert(key.to_string(), v.trim().trim_matches('"').to_string());
        }
    }
    Some(map)
}

/// Export `.env` entries into the process environment without clobbering
/// variables that are already set.
pub fn load_dotenv_if_present() -> Result<()> {
    if let Some(map) = parse_env_file() {
        for (k, v) in map {
            if std::env::var(&k).is_err() {
                std::env::set_var(k, v);
            }
        }
    }
    Ok(())
}

pub fn write_env_template(path: &str) -> Result<()> {
    let mut f = std::fs::File::create(Path::new(path))?;
    writeln!(f, "# txn_reconciler environment template")?;
    writeln!(f, "RECON_BO_FILE=bo.json")?;
    writeln!(f, "RECON_PARTNER_FILE=partner.json")?;
    writeln!(f, "RECON_BO_KEY=txn_id")?;
    writeln!(f, "RECON_PARTNER_KEY=reference")?;
    writeln!(f, "# boColumn=partnerColumn pairs, comma separated")?;
    writeln!(f, "RECON_KEY_PAIRS=")?;
    writeln!(f, "RECON_COMPARE_PAIRS=")?;
    writeln!(f, "RECON_TOLERANCE=0")?;
    writeln!(f, "# set to persist jobs in MySQL instead of memory")?;
    writeln!(f, "RECON_DB_URL=")?;
    Ok(())
}
