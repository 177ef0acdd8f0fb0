// cvar.rs: Named configuration variables.
//
// Values are stored as strings with a cached float. Files are TOML; nested
// tables flatten to dotted names, so `[world] cells = 64` sets `world.cells`.

use std::collections::HashMap;
use std::path::Path;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::error::{OzError, OzResult};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Written back by `write_variables`.
        const ARCHIVE = 0x01;
        /// Only `force_set` may change it.
        const NOSET   = 0x02;
        /// Changes while latching is active wait for `apply_latched`.
        const LATCH   = 0x04;
    }
}

/// A configuration variable.
#[derive(Clone, Debug)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

fn parse_value(s: &str) -> f32 {
    match s {
        "true" => 1.0,
        "false" => 0.0,
        _ => s.parse::<f32>().unwrap_or(0.0),
    }
}

/// The variable registry.
#[derive(Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    cvar_index: HashMap<String, usize>,
    /// Set while a world is running; LATCH variables defer their changes.
    pub latch_active: bool,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Float value of a variable, 0 if missing.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |v| v.value)
    }

    /// String value of a variable, "" if missing.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |v| v.string.as_str())
    }

    pub fn variable_bool(&self, name: &str) -> bool {
        self.variable_value(name) != 0.0
    }

    /// Comma separated list value, empty entries dropped.
    pub fn variable_list(&self, name: &str) -> Vec<String> {
        self.variable_string(name)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// Get or create a variable. An existing variable keeps its value and
    /// gains `flags`.
    pub fn get(&mut self, name: &str, default: &str, flags: CvarFlags) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: default.to_string(),
            latched_string: None,
            flags,
            modified: true,
            value: parse_value(default),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> usize {
        let idx = match self.cvar_index.get(name) {
            Some(&idx) => idx,
            None => return self.get(name, value, CvarFlags::empty()),
        };
        let latch_active = self.latch_active;
        let var = &mut self.cvar_vars[idx];

        if !force {
            if var.flags.contains(CvarFlags::NOSET) {
                warn!("{} is write protected", name);
                return idx;
            }
            if var.flags.contains(CvarFlags::LATCH) && latch_active {
                if var.latched_string.as_deref() != Some(value) && var.string != value {
                    info!("{} will be changed for the next world", name);
                    var.latched_string = Some(value.to_string());
                }
                return idx;
            }
        } else {
            var.latched_string = None;
        }

        if var.string == value {
            return idx;
        }

        debug!("cvar {} = \"{}\"", name, value);
        var.modified = true;
        var.string = value.to_string();
        var.value = parse_value(value);
        idx
    }

    /// Set a variable, honouring NOSET and LATCH.
    pub fn set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, false)
    }

    /// Set a variable, ignoring NOSET and LATCH.
    pub fn force_set(&mut self, name: &str, value: &str) -> usize {
        self.set2(name, value, true)
    }

    pub fn set_value(&mut self, name: &str, value: f32) -> usize {
        let s = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &s)
    }

    /// Apply all deferred LATCH changes.
    pub fn apply_latched(&mut self) {
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                var.value = parse_value(&latched);
                var.string = latched;
                var.modified = true;
            }
        }
    }

    /// Names of variables changed since the last call.
    pub fn take_modified(&mut self) -> Vec<String> {
        self.cvar_vars
            .iter_mut()
            .filter(|v| v.modified)
            .map(|v| {
                v.modified = false;
                v.name.clone()
            })
            .collect()
    }

    // ============================================================
    // TOML files
    // ============================================================

    /// Set every variable found in a TOML document.
    pub fn load_str(&mut self, contents: &str) -> OzResult<usize> {
        let table: toml::Table = toml::from_str(contents)
            .map_err(|e| OzError::Config(e.to_string()))?;
        let mut count = 0;
        self.load_table("", &table, &mut count)?;
        Ok(count)
    }

    fn load_table(&mut self, prefix: &str, table: &toml::Table, count: &mut usize) -> OzResult<()> {
        for (key, value) in table {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match value {
                toml::Value::Table(t) => self.load_table(&name, t, count)?,
                other => {
                    let s = value_to_string(&name, other)?;
                    self.set(&name, &s);
                    *count += 1;
                }
            }
        }
        Ok(())
    }

    /// Load a `.toml` configuration file.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> OzResult<usize> {
        let path = path.as_ref();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(OzError::UnsupportedFormat(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let count = self.load_str(&contents)?;
        info!("loaded {} variables from {}", count, path.display());
        Ok(count)
    }

    /// Archived variables as a nested TOML table.
    pub fn archived_table(&self) -> toml::Table {
        let mut root = toml::Table::new();
        for var in &self.cvar_vars {
            if !var.flags.contains(CvarFlags::ARCHIVE) {
                continue;
            }
            let parts: Vec<&str> = var.name.split('.').collect();
            insert_dotted(&mut root, &parts, string_to_value(&var.string));
        }
        root
    }

    /// Write all archived variables as TOML.
    pub fn write_variables(&self, writer: &mut dyn std::io::Write) -> OzResult<()> {
        let text = toml::to_string(&self.archived_table())
            .map_err(|e| OzError::Config(e.to_string()))?;
        writer.write_all(text.as_bytes())?;
        Ok(())
    }
}

fn value_to_string(name: &str, value: &toml::Value) -> OzResult<String> {
    Ok(match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Array(items) => {
            let parts: OzResult<Vec<String>> =
                items.iter().map(|v| value_to_string(name, v)).collect();
            parts?.join(",")
        }
        toml::Value::Datetime(_) | toml::Value::Table(_) => {
            return Err(OzError::Config(format!("unsupported value for {}", name)));
        }
    })
}

fn insert_dotted(table: &mut toml::Table, parts: &[&str], value: toml::Value) {
    match parts {
        [] => {}
        [leaf] => {
            table.insert(leaf.to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = table
                .entry(head.to_string())
                .or_insert(toml::Value::Table(toml::Table::new()));
            if let toml::Value::Table(t) = entry {
                insert_dotted(t, rest, value);
            }
        }
    }
}

fn string_to_value(s: &str) -> toml::Value {
    if let Ok(i) = s.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = s.parse::<f64>() {
        toml::Value::Float(f)
    } else if let Ok(b) = s.parse::<bool>() {
        toml::Value::Boolean(b)
    } else {
        toml::Value::String(s.to_string())
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvar_get_and_find() {
        let mut ctx = CvarContext::new();
        ctx.get("physics.gravity", "-9.81", CvarFlags::empty());
        assert_eq!(ctx.variable_value("physics.gravity"), -9.81);
        assert_eq!(ctx.variable_string("physics.gravity"), "-9.81");
        assert_eq!(ctx.variable_value("missing"), 0.0);
        assert_eq!(ctx.variable_string("missing"), "");
    }

    #[test]
    fn test_cvar_get_keeps_existing_value() {
        let mut ctx = CvarContext::new();
        let a = ctx.get("world.cells", "64", CvarFlags::empty());
        let b = ctx.get("world.cells", "128", CvarFlags::ARCHIVE);
        assert_eq!(a, b);
        assert_eq!(ctx.variable_value("world.cells"), 64.0);
        assert!(ctx.find_var("world.cells").unwrap().flags.contains(CvarFlags::ARCHIVE));
    }

    #[test]
    fn test_cvar_noset_and_force() {
        let mut ctx = CvarContext::new();
        ctx.get("version", "1", CvarFlags::NOSET);
        ctx.set("version", "2");
        assert_eq!(ctx.variable_string("version"), "1");
        ctx.force_set("version", "2");
        assert_eq!(ctx.variable_string("version"), "2");
    }

    #[test]
    fn test_cvar_latch() {
        let mut ctx = CvarContext::new();
        ctx.get("world.cells", "64", CvarFlags::LATCH);
        ctx.latch_active = true;
        ctx.set("world.cells", "32");
        assert_eq!(ctx.variable_value("world.cells"), 64.0, "latched change must wait");
        ctx.apply_latched();
        assert_eq!(ctx.variable_value("world.cells"), 32.0);
    }

    #[test]
    fn test_cvar_bool_and_list() {
        let mut ctx = CvarContext::new();
        ctx.set("run.save", "true");
        ctx.set("assets.bsp", "a.bsp, b.bsp,,");
        assert!(ctx.variable_bool("run.save"));
        assert_eq!(ctx.variable_list("assets.bsp"), vec!["a.bsp", "b.bsp"]);
    }

    #[test]
    fn test_take_modified_clears() {
        let mut ctx = CvarContext::new();
        ctx.get("a", "1", CvarFlags::empty());
        assert_eq!(ctx.take_modified(), vec!["a".to_string()]);
        assert!(ctx.take_modified().is_empty());
        ctx.set_value("a", 2.0);
        assert_eq!(ctx.variable_string("a"), "2");
        assert_eq!(ctx.take_modified().len(), 1);
    }

    // ============================================================
    // TOML
    // ============================================================

    #[test]
    fn test_load_nested_tables() {
        let mut ctx = CvarContext::new();
        let n = ctx
            .load_str(
                r#"
                tick_rate = 60
                [world]
                cells = 32
                cell_size = 16.0
                [assets]
                bsp = ["hut.ozbsp", "tower.ozbsp"]
                "#,
            )
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(ctx.variable_value("tick_rate"), 60.0);
        assert_eq!(ctx.variable_value("world.cells"), 32.0);
        assert_eq!(ctx.variable_list("assets.bsp").len(), 2);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut ctx = CvarContext::new();
        assert!(matches!(ctx.load_str("world = [ unclosed"), Err(OzError::Config(_))));
    }

    #[test]
    fn test_load_file_rejects_other_extensions() {
        let mut ctx = CvarContext::new();
        assert!(matches!(
            ctx.load_file("settings.ini"),
            Err(OzError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_write_variables_only_archived() {
        let mut ctx = CvarContext::new();
        ctx.get("world.cells", "64", CvarFlags::ARCHIVE);
        ctx.get("physics.gravity", "-9.81", CvarFlags::ARCHIVE);
        ctx.get("scratch", "1", CvarFlags::empty());

        let mut out = Vec::new();
        ctx.write_variables(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("cells = 64"));
        assert!(!text.contains("scratch"));

        let mut again = CvarContext::new();
        again.load_str(&text).unwrap();
        assert_eq!(again.variable_value("world.cells"), 64.0);
        assert_eq!(again.variable_value("physics.gravity"), -9.81);
    }
}
