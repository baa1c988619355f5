use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minijinja::value::Rest;
use minijinja::value::ViaDeserialize;
use minijinja::Environment;
use minijinja::ErrorKind;
use minijinja::Value;
use tracing::warn;

use super::Decryptor;
use super::KvPair;
use super::KvStore;
use crate::utils::file_io::file_exists;
use crate::KeyHook;
use crate::TemplateFn;

type FnResult<T> = std::result::Result<T, minijinja::Error>;

/// Function library handed to the template engine for one resource.
#[derive(Clone)]
pub struct TemplateFunc {
    store: KvStore,
    decryptor: Option<Arc<Decryptor>>,
    key_hook: Option<KeyHook>,
}

impl TemplateFunc {
    pub fn new(
        store: KvStore,
        decryptor: Option<Arc<Decryptor>>,
        key_hook: Option<KeyHook>,
    ) -> Self {
        Self {
            store,
            decryptor,
            key_hook,
        }
    }

    fn adjust(
        &self,
        key: &str,
    ) -> String {
        match &self.key_hook {
            Some(hook) => hook(key),
            None => key.to_string(),
        }
    }

    pub fn exists(
        &self,
        key: &str,
    ) -> bool {
        self.store.exists(&self.adjust(key))
    }

    pub fn get(
        &self,
        key: &str,
    ) -> FnResult<KvPair> {
        let key = self.adjust(key);
        self.store.get(&key).ok_or_else(|| missing_key(&key))
    }

    pub fn gets(
        &self,
        pattern: &str,
    ) -> FnResult<Vec<KvPair>> {
        self.store.get_all(&self.adjust(pattern)).map_err(invalid_op)
    }

    pub fn getv(
        &self,
        key: &str,
        default: Option<&str>,
    ) -> FnResult<String> {
        let key = self.adjust(key);
        self.store.get_value(&key, default).ok_or_else(|| missing_key(&key))
    }

    pub fn getvs(
        &self,
        pattern: &str,
    ) -> FnResult<Vec<String>> {
        self.store.get_all_values(&self.adjust(pattern)).map_err(invalid_op)
    }

    pub fn ls(
        &self,
        path: &str,
    ) -> Vec<String> {
        self.store.list(&self.adjust(path))
    }

    pub fn lsdir(
        &self,
        path: &str,
    ) -> Vec<String> {
        self.store.list_dir(&self.adjust(path))
    }

    fn decryptor(&self) -> Option<&Decryptor> {
        if self.decryptor.is_none() {
            warn!("encrypted value requested but no private key is configured");
        }
        self.decryptor.as_deref()
    }

    fn decrypt(
        decryptor: &Decryptor,
        value: &str,
    ) -> FnResult<String> {
        decryptor.decrypt(value).map_err(invalid_op)
    }

    pub fn cget(
        &self,
        key: &str,
    ) -> FnResult<Option<KvPair>> {
        let Some(decryptor) = self.decryptor() else {
            return Ok(None);
        };
        let mut kv = self.get(key)?;
        kv.value = Self::decrypt(decryptor, &kv.value)?;
        Ok(Some(kv))
    }

    pub fn cgets(
        &self,
        pattern: &str,
    ) -> FnResult<Vec<KvPair>> {
        let Some(decryptor) = self.decryptor() else {
            return Ok(Vec::new());
        };
        self.gets(pattern)?
            .into_iter()
            .map(|mut kv| {
                kv.value = Self::decrypt(decryptor, &kv.value)?;
                Ok(kv)
            })
            .collect()
    }

    pub fn cgetv(
        &self,
        key: &str,
    ) -> FnResult<String> {
        let Some(decryptor) = self.decryptor() else {
            return Ok(String::new());
        };
        Self::decrypt(decryptor, &self.getv(key, None)?)
    }

    pub fn cgetvs(
        &self,
        pattern: &str,
    ) -> FnResult<Vec<String>> {
        let Some(decryptor) = self.decryptor() else {
            return Ok(Vec::new());
        };
        let mut values = self
            .gets(pattern)?
            .into_iter()
            .map(|kv| Self::decrypt(decryptor, &kv.value))
            .collect::<FnResult<Vec<_>>>()?;
        values.sort();
        Ok(values)
    }

    /// Installs the key/value accessors and helper functions, then
    /// `extra`, which may override built-ins.
    pub fn register(
        &self,
        env: &mut Environment<'_>,
        extra: &HashMap<String, TemplateFn>,
    ) {
        self.register_store_accessors(env);
        register_helpers(env);
        for (name, f) in extra {
            let f = f.clone();
            env.add_function(name.clone(), move |args: Rest<Value>| f(&args));
        }
    }

    fn register_store_accessors(
        &self,
        env: &mut Environment<'_>,
    ) {
        let this = self.clone();
        env.add_function("exists", move |key: String| this.exists(&key));
        let this = self.clone();
        env.add_function("get", move |key: String| -> FnResult<Value> {
            Ok(Value::from_serialize(this.get(&key)?))
        });
        let this = self.clone();
        env.add_function("gets", move |pattern: String| -> FnResult<Value> {
            Ok(Value::from_serialize(this.gets(&pattern)?))
        });
        let this = self.clone();
        env.add_function("getv", move |key: String, default: Option<String>| {
            this.getv(&key, default.as_deref())
        });
        let this = self.clone();
        env.add_function("getvs", move |pattern: String| this.getvs(&pattern));
        let this = self.clone();
        env.add_function("ls", move |path: String| this.ls(&path));
        let this = self.clone();
        env.add_function("lsdir", move |path: String| this.lsdir(&path));

        let this = self.clone();
        env.add_function("cget", move |key: String| -> FnResult<Value> {
            Ok(match this.cget(&key)? {
                Some(kv) => Value::from_serialize(kv),
                None => Value::from(""),
            })
        });
        let this = self.clone();
        env.add_function("cgets", move |pattern: String| -> FnResult<Value> {
            Ok(Value::from_serialize(this.cgets(&pattern)?))
        });
        let this = self.clone();
        env.add_function("cgetv", move |key: String| this.cgetv(&key));
        let this = self.clone();
        env.add_function("cgetvs", move |pattern: String| this.cgetvs(&pattern));
    }
}

fn register_helpers(env: &mut Environment<'_>) {
    env.add_function("base", |path: String| {
        Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    env.add_function("dir", |path: String| {
        Path::new(&path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string())
    });
    env.add_function("split", |s: String, sep: String| -> Vec<String> {
        s.split(sep.as_str()).map(str::to_string).collect()
    });
    env.add_function("join", |items: Vec<String>, sep: String| items.join(&sep));
    env.add_function("toUpper", |s: String| s.to_uppercase());
    env.add_function("toLower", |s: String| s.to_lowercase());
    env.add_function("contains", |s: String, sub: String| s.contains(&sub));
    env.add_function("replace", |s: String, old: String, new: String, n: Option<i64>| match n {
        Some(n) if n >= 0 => s.replacen(&old, &new, n as usize),
        _ => s.replace(&old, &new),
    });
    env.add_function("trimSuffix", |s: String, suffix: String| {
        s.strip_suffix(suffix.as_str()).map(str::to_string).unwrap_or(s.clone())
    });
    env.add_function("trimPrefix", |s: String, prefix: String| {
        s.strip_prefix(prefix.as_str()).map(str::to_string).unwrap_or(s.clone())
    });
    env.add_function("trim", |s: String, cutset: Option<String>| match cutset {
        Some(cutset) => s.trim_matches(|c| cutset.contains(c)).to_string(),
        None => s.trim().to_string(),
    });
    env.add_function("json", |s: String| -> FnResult<Value> {
        let v: serde_json::Value = serde_json::from_str(&s).map_err(invalid_op)?;
        if !v.is_object() {
            return Err(invalid_op(format!("json: expected an object, got {s}")));
        }
        Ok(Value::from_serialize(v))
    });
    env.add_function("jsonArray", |s: String| -> FnResult<Value> {
        let v: Vec<serde_json::Value> = serde_json::from_str(&s).map_err(invalid_op)?;
        Ok(Value::from_serialize(v))
    });
    env.add_function("map", |args: Rest<Value>| -> FnResult<Value> {
        if args.len() % 2 != 0 {
            return Err(invalid_op("map: odd number of arguments"));
        }
        let mut m = BTreeMap::new();
        for pair in args.chunks(2) {
            let key = pair[0]
                .as_str()
                .ok_or_else(|| invalid_op("map: keys must be strings"))?
                .to_string();
            m.insert(key, pair[1].clone());
        }
        Ok(Value::from(m))
    });
    env.add_function("base64Encode", |s: String| STANDARD.encode(s.as_bytes()));
    env.add_function("base64Decode", |s: String| -> FnResult<String> {
        let bytes = STANDARD.decode(s.trim()).map_err(invalid_op)?;
        String::from_utf8(bytes).map_err(invalid_op)
    });
    env.add_function("getenv", |key: String, default: Option<String>| {
        std::env::var(&key)
            .ok()
            .filter(|v| !v.is_empty())
            .or(default)
            .unwrap_or_default()
    });
    env.add_function("datetime", || chrono::Local::now().to_rfc3339());
    env.add_function("lookupIP", |host: String| lookup_ip(&host));
    env.add_function("fileExists", |path: String| file_exists(path));
    env.add_function("parseBool", |s: String| parse_bool(&s));
    env.add_function("atoi", |s: String| -> FnResult<i64> { s.trim().parse::<i64>().map_err(invalid_op) });
    env.add_function("add", |a: i64, b: i64| a.wrapping_add(b));
    env.add_function("sub", |a: i64, b: i64| a.wrapping_sub(b));
    env.add_function("mul", |a: i64, b: i64| a.wrapping_mul(b));
    env.add_function("div", |a: i64, b: i64| -> FnResult<i64> {
        a.checked_div(b).ok_or_else(|| invalid_op("div: division by zero"))
    });
    env.add_function("mod", |a: i64, b: i64| -> FnResult<i64> {
        a.checked_rem(b).ok_or_else(|| invalid_op("mod: division by zero"))
    });
    env.add_function("seq", |first: i64, last: i64| -> Vec<i64> { (first..=last).collect() });
    env.add_function("reverse", |v: Value| -> FnResult<Value> {
        if let Some(s) = v.as_str() {
            return Ok(Value::from(s.chars().rev().collect::<String>()));
        }
        let mut items: Vec<Value> = v.try_iter()?.collect();
        items.reverse();
        Ok(Value::from(items))
    });
    env.add_function("sortByLength", |mut items: Vec<String>| {
        items.sort_by_key(|s| s.len());
        items
    });
    env.add_function("sortKVByLength", |items: ViaDeserialize<Vec<KvPair>>| -> Value {
        let mut items = items.0;
        items.sort_by_key(|kv| kv.key.len());
        Value::from_serialize(items)
    });
}

/// Resolves `host` and returns its addresses sorted and de-duplicated.
pub fn lookup_ip(host: &str) -> Vec<String> {
    let mut ips: Vec<String> = match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip().to_string()).collect(),
        Err(e) => {
            warn!("lookupIP {} failed: {}", host, e);
            Vec::new()
        }
    };
    ips.sort();
    ips.dedup();
    ips
}

fn parse_bool(s: &str) -> FnResult<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        other => Err(invalid_op(format!("parseBool: invalid syntax {other:?}"))),
    }
}

fn missing_key(key: &str) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, format!("key does not exist: {key}"))
}

fn invalid_op(e: impl std::fmt::Display) -> minijinja::Error {
    minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string())
}
