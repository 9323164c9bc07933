use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};

use anyhow::{
  Context,
  anyhow
};
use chrono::Duration;
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::undo::DEFAULT_UNDO_WINDOW_SECS;
use crate::view::ViewFilter;

const DEFAULT_DATA_DIR: &str =
  "~/.nudge";

/// Flat `key = value` settings from
/// the nudgerc plus command-line
/// overrides.
#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>
}

impl Default for Config {
  fn default() -> Self {
    let undo_window =
      DEFAULT_UNDO_WINDOW_SECS
        .to_string();
    let map = [
      (
        "data.location",
        DEFAULT_DATA_DIR
      ),
      (
        "undo.window",
        undo_window.as_str()
      ),
      ("reminders", "on"),
      ("color", "on"),
      ("default.filter", "all")
    ]
    .into_iter()
    .map(|(k, v)| {
      (k.to_string(), v.to_string())
    })
    .collect();

    Self { map }
  }
}

enum RcLine<'a> {
  Include(&'a str),
  Set(&'a str, &'a str)
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();

    match resolve_rc_path(rc_override)
    {
      | Some(path) => {
        info!(rc = %path.display(), "loading nudgerc");
        let mut chain = Vec::new();
        cfg.read_rc(&path, &mut chain)?;
      }
      | None => {
        debug!(
          "no nudgerc; using defaults"
        );
      }
    }

    Ok(cfg)
  }

  /// Later overrides win. A leading
  /// `rc.` on the key is dropped.
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .map(str::to_string)
        .unwrap_or(k);
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  /// Reads an on/off key; anything
  /// unrecognised is an error rather
  /// than a silent "off".
  pub fn flag(
    &self,
    key: &str,
    default: bool
  ) -> anyhow::Result<bool> {
    match self.map.get(key) {
      | None => Ok(default),
      | Some(raw) => {
        parse_flag(raw).ok_or_else(
          || {
            anyhow!(
              "invalid {key} setting: \
               {raw}"
            )
          }
        )
      }
    }
  }

  pub fn undo_window(
    &self
  ) -> anyhow::Result<Duration> {
    let raw = self
      .get("undo.window")
      .unwrap_or_default();
    let secs: i64 = raw
      .trim()
      .parse()
      .with_context(|| {
        format!(
          "invalid undo.window: {raw}"
        )
      })?;
    if secs <= 0 {
      return Err(anyhow!(
        "undo.window must be positive, \
         got {secs}"
      ));
    }
    Duration::try_seconds(secs)
      .ok_or_else(|| {
        anyhow!(
          "undo.window too large: {secs}"
        )
      })
  }

  pub fn default_filter(
    &self
  ) -> anyhow::Result<ViewFilter> {
    match self.get("default.filter") {
      | Some(raw) => raw.parse(),
      | None => Ok(ViewFilter::All)
    }
  }

  pub fn reminders_enabled(
    &self
  ) -> anyhow::Result<bool> {
    self.flag("reminders", true)
  }

  pub fn color_enabled(
    &self
  ) -> anyhow::Result<bool> {
    self.flag("color", true)
  }

  pub fn timezone(
    &self
  ) -> Option<String> {
    self
      .get("timezone")
      .filter(|tz| !tz.trim().is_empty())
  }

  /// `chain` holds the files currently
  /// being read, outermost first.
  fn read_rc(
    &mut self,
    path: &Path,
    chain: &mut Vec<PathBuf>
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let key = fs::canonicalize(&path)
      .unwrap_or_else(|_| path.clone());
    if chain.contains(&key) {
      return Err(anyhow!(
        "include loop at {}",
        path.display()
      ));
    }

    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;
    chain.push(key);

    let base_dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_default();

    for (idx, raw_line) in
      text.lines().enumerate()
    {
      let line_no = idx + 1;
      match parse_line(raw_line) {
        | None => {}
        | Some(RcLine::Include(
          target
        )) => {
          let target =
            base_dir.join(expand_tilde(
              Path::new(target)
            ));
          if target.exists() {
            debug!(include = %target.display(), line = line_no, "following include");
            self
              .read_rc(&target, chain)?;
          } else {
            warn!(include = %target.display(), "include file does not exist; skipping");
          }
        }
        | Some(RcLine::Set(k, v)) => {
          if k.is_empty() {
            return Err(anyhow!(
              "{}:{line_no}: missing key \
               in `{raw_line}`",
              path.display()
            ));
          }
          trace!(key = k, value = v, "rc setting");
          self.map.insert(
            k.to_string(),
            v.to_string()
          );
        }
      }
    }

    chain.pop();
    Ok(())
  }
}

fn parse_line(
  raw: &str
) -> Option<RcLine<'_>> {
  let line = raw
    .split_once('#')
    .map_or(raw, |(before, _)| before)
    .trim();
  if line.is_empty() {
    return None;
  }
  if let Some(rest) =
    line.strip_prefix("include ")
  {
    return Some(RcLine::Include(
      rest.trim()
    ));
  }
  Some(match line.split_once('=') {
    | Some((k, v)) => {
      RcLine::Set(k.trim(), v.trim())
    }
    | None => RcLine::Set("", line)
  })
}

/// `--data` wins over `data.location`;
/// the directory is created if absent.
#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = match override_dir {
    | Some(path) => path.to_path_buf(),
    | None => {
      let raw = cfg
        .get("data.location")
        .unwrap_or_else(|| {
          DEFAULT_DATA_DIR.to_string()
        });
      let dir =
        expand_tilde(Path::new(&raw));
      if dir.starts_with("~") {
        return Err(anyhow!(
          "cannot determine home \
           directory for {raw}"
        ));
      }
      dir
    }
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

/// `--nudgerc`, then `$NUDGERC`
/// (`/dev/null` turns the file off),
/// then `~/.nudgerc` when it exists.
fn resolve_rc_path(
  override_path: Option<&Path>
) -> Option<PathBuf> {
  if let Some(path) = override_path {
    return Some(path.to_path_buf());
  }

  if let Ok(rc_env) =
    std::env::var("NUDGERC")
  {
    return (rc_env != "/dev/null")
      .then(|| PathBuf::from(rc_env));
  }

  let candidate = dirs::home_dir()?
    .join(".nudgerc");
  candidate
    .exists()
    .then_some(candidate)
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  if let Ok(rest) =
    path.strip_prefix("~")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_flag(
  raw: &str
) -> Option<bool> {
  match raw
    .trim()
    .to_ascii_lowercase()
    .as_str()
  {
    | "1" | "y" | "yes" | "on"
    | "true" => Some(true),
    | "0" | "n" | "no" | "off"
    | "false" => Some(false),
    | _ => None
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempfile::tempdir;

  use super::*;

  #[test]
  fn defaults_without_rc_file() {
    let cfg = Config::default();
    assert_eq!(
      cfg.undo_window().unwrap(),
      Duration::seconds(8)
    );
    assert!(
      cfg.reminders_enabled().unwrap()
    );
    assert!(
      cfg.color_enabled().unwrap()
    );
    assert_eq!(
      cfg.default_filter().unwrap(),
      ViewFilter::All
    );
    assert!(cfg.timezone().is_none());
  }

  #[test]
  fn rc_file_with_include_and_comments()
  {
    let temp = tempdir().unwrap();
    let extra = temp.path().join("extra.rc");
    fs::write(
      &extra,
      "reminders = off\n\
       timezone = Europe/Berlin\n"
    )
    .unwrap();
    let rc = temp.path().join("nudgerc");
    fs::write(
      &rc,
      "# personal setup\n\
       undo.window = 15  # seconds\n\
       include extra.rc\n\
       include missing.rc\n"
    )
    .unwrap();

    let cfg =
      Config::load(Some(&rc)).unwrap();
    assert_eq!(
      cfg.undo_window().unwrap(),
      Duration::seconds(15)
    );
    assert!(
      !cfg.reminders_enabled().unwrap()
    );
    assert_eq!(
      cfg.timezone().as_deref(),
      Some("Europe/Berlin")
    );
  }

  #[test]
  fn include_loop_is_an_error() {
    let temp = tempdir().unwrap();
    let a = temp.path().join("a.rc");
    let b = temp.path().join("b.rc");
    fs::write(&a, "include b.rc\n")
      .unwrap();
    fs::write(&b, "include a.rc\n")
      .unwrap();

    let err =
      Config::load(Some(&a)).unwrap_err();
    assert!(
      err
        .to_string()
        .contains("include loop")
    );
  }

  #[test]
  fn line_without_key_is_rejected() {
    let temp = tempdir().unwrap();
    let rc = temp.path().join("nudgerc");
    fs::write(&rc, "color off\n")
      .unwrap();
    assert!(
      Config::load(Some(&rc)).is_err()
    );
  }

  #[test]
  fn overrides_strip_rc_prefix() {
    let mut cfg = Config::default();
    cfg.apply_overrides(vec![(
      "rc.default.filter".to_string(),
      "today".to_string()
    )]);
    assert_eq!(
      cfg.default_filter().unwrap(),
      ViewFilter::Today
    );
  }

  #[test]
  fn flags_reject_garbage() {
    let mut cfg = Config::default();
    cfg.apply_overrides(vec![(
      "color".to_string(),
      "sometimes".to_string()
    )]);
    assert!(cfg.color_enabled().is_err());
    assert!(
      !cfg.flag("missing", false).unwrap()
    );
    assert!(
      cfg.flag("reminders", false).unwrap()
    );
  }

  #[test]
  fn rejects_bad_undo_window() {
    let mut cfg = Config::default();
    cfg.apply_overrides(vec![(
      "undo.window".to_string(),
      "0".to_string()
    )]);
    assert!(cfg.undo_window().is_err());
  }
}
