//! Rendering context — the function table exposed to templates.
//!
//! Each template resource owns one [`RenderContext`]: a tera instance whose
//! registered functions are the template's *exclusive* data-access surface.
//! Store accessors are bound to the resource's [`Store`]; encrypted variants
//! are registered only when a decrypter is configured, so referencing them
//! without one fails the render with an unknown-function error.
//!
//! Everything is pure except `getenv` and the DNS lookups, which read
//! external state at render time. DNS failures yield empty results rather
//! than aborting the render.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hickory_resolver::Resolver;
use tera::{Context, Tera, Value};

use confsync_store::{KVPair, Store};

use crate::secrets::Decrypt;

/// Store handle shared between the pipeline (writer) and the registered
/// functions (readers). Exclusively owned by one resource.
pub type SharedStore = Arc<RwLock<Store>>;

// ---------------------------------------------------------------------------
// RenderContext
// ---------------------------------------------------------------------------

/// Tera engine wired to one resource's store.
pub struct RenderContext {
    tera: Tera,
}

impl RenderContext {
    /// Build the context from the base function set plus the optional
    /// encrypted extensions, decided once at resource construction.
    pub fn new(store: SharedStore, decrypter: Option<Arc<dyn Decrypt>>) -> Self {
        let mut tera = Tera::default();
        // Rendered output is raw configuration, never HTML.
        tera.autoescape_on(vec![]);

        register_store_functions(&mut tera, store.clone());
        if let Some(decrypter) = decrypter {
            register_crypt_functions(&mut tera, store, decrypter);
        }
        register_util_functions(&mut tera);
        register_filters(&mut tera);

        RenderContext { tera }
    }

    /// (Re-)register a named template body. Called every cycle so on-disk
    /// template edits take effect without a restart.
    pub fn add_template(&mut self, name: &str, body: &str) -> tera::Result<()> {
        self.tera.add_raw_template(name, body)
    }

    /// Render a previously added template. All data flows through the
    /// registered functions; the variable context is empty.
    pub fn render(&self, name: &str) -> tera::Result<String> {
        self.tera.render(name, &Context::new())
    }
}

/// Render a one-off command template (check/reload) with plain variables.
/// Command templates get no store access.
pub fn render_command(template: &str, vars: &[(&str, &str)]) -> tera::Result<String> {
    let mut ctx = Context::new();
    for (name, value) in vars {
        ctx.insert(*name, value);
    }
    Tera::one_off(template, &ctx, false)
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn str_arg(args: &HashMap<String, Value>, name: &str) -> Option<String> {
    args.get(name).and_then(Value::as_str).map(str::to_string)
}

fn required_str(args: &HashMap<String, Value>, name: &str, func: &str) -> tera::Result<String> {
    str_arg(args, name)
        .ok_or_else(|| tera::Error::msg(format!("{func}: missing string argument `{name}`")))
}

fn required_int(args: &HashMap<String, Value>, name: &str, func: &str) -> tera::Result<i64> {
    args.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| tera::Error::msg(format!("{func}: missing integer argument `{name}`")))
}

fn kv_to_value(kv: KVPair) -> tera::Result<Value> {
    serde_json::to_value(kv).map_err(tera::Error::msg)
}

// ---------------------------------------------------------------------------
// Store accessors
// ---------------------------------------------------------------------------

fn register_store_functions(tera: &mut Tera, store: SharedStore) {
    let s = store.clone();
    tera.register_function(
        "get",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let key = required_str(args, "key", "get")?;
            let kv = s
                .read()
                .expect("store lock poisoned")
                .get(&key)
                .map_err(tera::Error::msg)?;
            kv_to_value(kv)
        },
    );

    let s = store.clone();
    tera.register_function(
        "gets",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let pattern = required_str(args, "pattern", "gets")?;
            let kvs = s.read().expect("store lock poisoned").get_all(&pattern);
            serde_json::to_value(kvs).map_err(tera::Error::msg)
        },
    );

    let s = store.clone();
    tera.register_function(
        "getv",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let key = required_str(args, "key", "getv")?;
            let default = str_arg(args, "default");
            let value = s
                .read()
                .expect("store lock poisoned")
                .get_value(&key, default.as_deref())
                .map_err(tera::Error::msg)?;
            Ok(Value::String(value))
        },
    );

    let s = store.clone();
    tera.register_function(
        "getvs",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let pattern = required_str(args, "pattern", "getvs")?;
            let values = s
                .read()
                .expect("store lock poisoned")
                .get_all_values(&pattern);
            serde_json::to_value(values).map_err(tera::Error::msg)
        },
    );

    let s = store.clone();
    tera.register_function(
        "ls",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let dir = required_str(args, "dir", "ls")?;
            let names = s.read().expect("store lock poisoned").list(&dir);
            serde_json::to_value(names).map_err(tera::Error::msg)
        },
    );

    let s = store;
    tera.register_function(
        "lsdir",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let dir = required_str(args, "dir", "lsdir")?;
            let names = s.read().expect("store lock poisoned").list_dir(&dir);
            serde_json::to_value(names).map_err(tera::Error::msg)
        },
    );
}

// ---------------------------------------------------------------------------
// Encrypted accessors — wrap the plain getters through the decrypter
// ---------------------------------------------------------------------------

fn register_crypt_functions(tera: &mut Tera, store: SharedStore, decrypter: Arc<dyn Decrypt>) {
    let s = store.clone();
    let d = decrypter.clone();
    tera.register_function(
        "cget",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let key = required_str(args, "key", "cget")?;
            let mut kv = s
                .read()
                .expect("store lock poisoned")
                .get(&key)
                .map_err(tera::Error::msg)?;
            kv.value = d.decrypt(&kv.value).map_err(tera::Error::msg)?;
            kv_to_value(kv)
        },
    );

    let s = store.clone();
    let d = decrypter.clone();
    tera.register_function(
        "cgets",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let pattern = required_str(args, "pattern", "cgets")?;
            let mut kvs = s.read().expect("store lock poisoned").get_all(&pattern);
            for kv in &mut kvs {
                kv.value = d.decrypt(&kv.value).map_err(tera::Error::msg)?;
            }
            serde_json::to_value(kvs).map_err(tera::Error::msg)
        },
    );

    let s = store.clone();
    let d = decrypter.clone();
    tera.register_function(
        "cgetv",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let key = required_str(args, "key", "cgetv")?;
            let value = s
                .read()
                .expect("store lock poisoned")
                .get_value(&key, None)
                .map_err(tera::Error::msg)?;
            Ok(Value::String(d.decrypt(&value).map_err(tera::Error::msg)?))
        },
    );

    let s = store;
    let d = decrypter;
    tera.register_function(
        "cgetvs",
        move |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let pattern = required_str(args, "pattern", "cgetvs")?;
            let values = s
                .read()
                .expect("store lock poisoned")
                .get_all_values(&pattern);
            let decrypted: Result<Vec<String>, _> =
                values.iter().map(|v| d.decrypt(v)).collect();
            serde_json::to_value(decrypted.map_err(tera::Error::msg)?).map_err(tera::Error::msg)
        },
    );
}

// ---------------------------------------------------------------------------
// General utilities
// ---------------------------------------------------------------------------

fn register_util_functions(tera: &mut Tera) {
    tera.register_function(
        "getenv",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let name = required_str(args, "name", "getenv")?;
            let default = str_arg(args, "default").unwrap_or_default();
            Ok(Value::String(std::env::var(&name).unwrap_or(default)))
        },
    );

    tera.register_function(
        "seq",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let from = required_int(args, "from", "seq")?;
            let to = required_int(args, "to", "seq")?;
            let values: Vec<i64> = (from..=to).collect();
            serde_json::to_value(values).map_err(tera::Error::msg)
        },
    );

    tera.register_function(
        "lookup_ip",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let host = required_str(args, "host", "lookup_ip")?;
            serde_json::to_value(resolve_ips(&host)).map_err(tera::Error::msg)
        },
    );

    tera.register_function(
        "lookup_ipv4",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let host = required_str(args, "host", "lookup_ipv4")?;
            let v4: Vec<String> = resolve_ips(&host)
                .into_iter()
                .filter(|ip| ip.contains('.'))
                .collect();
            serde_json::to_value(v4).map_err(tera::Error::msg)
        },
    );

    tera.register_function(
        "lookup_ipv6",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let host = required_str(args, "host", "lookup_ipv6")?;
            let v6: Vec<String> = resolve_ips(&host)
                .into_iter()
                .filter(|ip| ip.contains(':'))
                .collect();
            serde_json::to_value(v6).map_err(tera::Error::msg)
        },
    );

    tera.register_function(
        "lookup_srv",
        |args: &HashMap<String, Value>| -> tera::Result<Value> {
            let service = required_str(args, "service", "lookup_srv")?;
            let proto = required_str(args, "proto", "lookup_srv")?;
            let name = required_str(args, "name", "lookup_srv")?;
            serde_json::to_value(resolve_srv(&service, &proto, &name)).map_err(tera::Error::msg)
        },
    );
}

/// Run a blocking resolver call on its own thread. The blocking `Resolver`
/// drives an internal runtime via `block_on`, which panics when invoked from
/// a tokio worker thread — and renders run inside the tokio-hosted pipeline.
fn on_dns_thread<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> Option<T> {
    std::thread::spawn(f).join().ok()
}

/// All addresses for `host`, as sorted strings. Failures resolve to empty.
fn resolve_ips(host: &str) -> Vec<String> {
    let host = host.to_string();
    on_dns_thread(move || {
        let Ok(resolver) = Resolver::from_system_conf() else {
            return Vec::new();
        };
        match resolver.lookup_ip(host.as_str()) {
            Ok(lookup) => {
                let mut ips: Vec<String> = lookup.iter().map(|ip| ip.to_string()).collect();
                ips.sort();
                ips
            }
            Err(_) => Vec::new(),
        }
    })
    .unwrap_or_default()
}

#[derive(Debug, serde::Serialize)]
struct SrvRecord {
    target: String,
    port: u16,
    priority: u16,
    weight: u16,
}

/// SRV records for `_service._proto.name`, deterministically sorted.
/// Failures resolve to empty.
fn resolve_srv(service: &str, proto: &str, name: &str) -> Vec<SrvRecord> {
    let query = format!("_{service}._{proto}.{name}");
    on_dns_thread(move || {
        let Ok(resolver) = Resolver::from_system_conf() else {
            return Vec::new();
        };
        match resolver.srv_lookup(query) {
            Ok(lookup) => {
                let mut records: Vec<SrvRecord> = lookup
                    .iter()
                    .map(|srv| SrvRecord {
                        target: srv.target().to_string(),
                        port: srv.port(),
                        priority: srv.priority(),
                        weight: srv.weight(),
                    })
                    .collect();
                records.sort_by(|a, b| {
                    (&a.target, a.port, a.priority, a.weight)
                        .cmp(&(&b.target, b.port, b.priority, b.weight))
                });
                records
            }
            Err(_) => Vec::new(),
        }
    })
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn register_filters(tera: &mut Tera) {
    tera.register_filter(
        "base64_encode",
        |value: &Value, _: &HashMap<String, Value>| -> tera::Result<Value> {
            let s = value
                .as_str()
                .ok_or_else(|| tera::Error::msg("base64_encode: expected a string"))?;
            Ok(Value::String(BASE64.encode(s)))
        },
    );

    tera.register_filter(
        "base64_decode",
        |value: &Value, _: &HashMap<String, Value>| -> tera::Result<Value> {
            let s = value
                .as_str()
                .ok_or_else(|| tera::Error::msg("base64_decode: expected a string"))?;
            let bytes = BASE64.decode(s).map_err(tera::Error::msg)?;
            let decoded = String::from_utf8(bytes).map_err(tera::Error::msg)?;
            Ok(Value::String(decoded))
        },
    );

    tera.register_filter(
        "json_decode",
        |value: &Value, _: &HashMap<String, Value>| -> tera::Result<Value> {
            let s = value
                .as_str()
                .ok_or_else(|| tera::Error::msg("json_decode: expected a string"))?;
            serde_json::from_str(s).map_err(tera::Error::msg)
        },
    );

    tera.register_filter(
        "sort_by_length",
        |value: &Value, _: &HashMap<String, Value>| -> tera::Result<Value> {
            let Some(items) = value.as_array() else {
                return Err(tera::Error::msg("sort_by_length: expected an array"));
            };
            let mut items = items.clone();
            items.sort_by_key(|item| match item {
                // KV lists sort by key length; plain lists by element length.
                Value::Object(obj) => obj
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0),
                Value::String(s) => s.len(),
                _ => 0,
            });
            Ok(Value::Array(items))
        },
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
