use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use grantline_core::keys;
use grantline_core::token::{sign, LicenseToken, TrustAnchors};

use crate::{KeyCommands, LicenseCommands};

// ─── Grant Parsing ──────────────────────────────────────────────────────────

/// `<dns-label>.<dns-suffix>/<unit>=<amount>`
const GRANT_PATTERN: &str = r"^(([a-zA-Z])|([a-zA-Z]{2})|([a-zA-Z][0-9])|([0-9][a-zA-Z])|([a-zA-Z0-9][a-zA-Z0-9_-]{1,61}[a-zA-Z0-9]))\.([a-zA-Z]{2,6}|[a-zA-Z0-9-]{2,30}\.[a-zA-Z]{2,3})/[a-zA-Z0-9]+=[0-9]+$";

/// Splits a `--grant` flag into token key and amount.
pub fn parse_grant(raw: &str) -> anyhow::Result<(String, u64)> {
    if !Regex::new(GRANT_PATTERN)?.is_match(raw) {
        bail!("grant '{raw}' is not of the form <entitlement-domain>/<unit>=<amount>");
    }
    let (key, amount) = raw
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("grant '{raw}' has no amount"))?;
    let amount = amount
        .parse()
        .with_context(|| format!("grant '{raw}' amount is out of range"))?;
    Ok((key.to_string(), amount))
}

pub fn parse_metadata(raw: &str) -> anyhow::Result<(String, String)> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => bail!("metadata '{raw}' is not of the form key=value"),
    }
}

/// Midnight UTC of a `YYYY-MM-DD` day.
pub fn parse_day(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("'{raw}' is not a YYYY-MM-DD date"))?;
    Ok(day.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Builds the unsigned token from CLI flags.
pub fn build_token(
    id: String,
    licensee: String,
    grants: &[String],
    metadata: &[String],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> anyhow::Result<LicenseToken> {
    if licensee.trim().is_empty() {
        bail!("licensee must not be empty");
    }
    if not_after <= not_before {
        bail!("not-after ({not_after}) must be later than not-before ({not_before})");
    }

    let mut grant_map = BTreeMap::new();
    for raw in grants {
        let (key, amount) = parse_grant(raw)?;
        if grant_map.insert(key.clone(), amount).is_some() {
            bail!("grant '{key}' given more than once");
        }
    }
    let metadata = metadata
        .iter()
        .map(|raw| parse_metadata(raw))
        .collect::<anyhow::Result<BTreeMap<_, _>>>()?;

    Ok(LicenseToken {
        id,
        licensee,
        metadata,
        grants: grant_map,
        not_before,
        not_after,
    })
}

// ─── Commands ───────────────────────────────────────────────────────────────

pub fn run_key(command: KeyCommands) -> anyhow::Result<()> {
    match command {
        KeyCommands::Generate {
            bits,
            name,
            write_files,
        } => {
            let private = keys::generate_private_key(bits)?;
            let private_pem = keys::encode_private_key(&private)?;
            let public_pem = keys::encode_public_key(&private.to_public_key())?;

            if write_files {
                let key_path = PathBuf::from(format!("{name}.key"));
                let pub_path = PathBuf::from(format!("{name}.pub"));
                write_new(&key_path, &private_pem)?;
                write_new(&pub_path, &public_pem)?;
                tracing::info!(private = %key_path.display(), public = %pub_path.display(), bits, "keypair written");
            } else {
                print!("{private_pem}");
                print!("{public_pem}");
            }
        }
    }
    Ok(())
}

pub fn run_license(command: LicenseCommands) -> anyhow::Result<()> {
    match command {
        LicenseCommands::Generate {
            licensee,
            grants,
            metadata,
            not_before,
            not_after,
            key,
            id,
            out,
        } => {
            let not_before = match not_before {
                Some(day) => parse_day(&day)?,
                None => parse_day(&Utc::now().format("%Y-%m-%d").to_string())?,
            };
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let token = build_token(id, licensee, &grants, &metadata, not_before, parse_day(&not_after)?)?;

            let signing_key = keys::load_private_key(&key)
                .with_context(|| format!("cannot load signing key {}", key.display()))?;
            let signed = sign(&token, &signing_key)?;

            match out {
                Some(path) => {
                    write_new(&path, &signed)?;
                    tracing::info!(id = %token.id, path = %path.display(), "license written");
                }
                None => println!("{signed}"),
            }
        }
        LicenseCommands::Inspect {
            trust_anchors,
            token,
        } => {
            let anchors = TrustAnchors::from_pem_files(&trust_anchors)?;
            let raw = match token.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read token file {path}"))?,
                None => token,
            };
            let decoded = anchors.verify(raw.as_bytes())?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
            if !decoded.is_valid_at(Utc::now()) {
                eprintln!(
                    "warning: token is valid only from {} until {}",
                    decoded.not_before, decoded.not_after
                );
            }
        }
    }
    Ok(())
}

fn write_new(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        bail!("refusing to overwrite {}", path.display());
    }
    std::fs::write(path, contents).with_context(|| format!("cannot write {}", path.display()))
}
