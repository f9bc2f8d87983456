//! 杂项工具：按 id 建表的序列化辅助、shell 转义。

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 以自身 id 为键存入表中的对象
pub trait Keyed {
    type Key: Ord + Copy + std::fmt::Debug;
    fn key(&self) -> Self::Key;
}

/// id 表在 JSON 中序列化为对象数组，反序列化时按 id 重建并拒绝重复 id。
pub mod id_table {
    use super::*;

    pub fn serialize<S, K, V>(map: &BTreeMap<K, V>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        s.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(d: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de> + Keyed,
    {
        let items = Vec::<V>::deserialize(d)?;
        let mut map = BTreeMap::new();
        for item in items {
            let key = item.key();
            if map.insert(key, item).is_some() {
                return Err(D::Error::custom(format!("duplicate id {key:?}")));
            }
        }
        Ok(map)
    }
}

/// 单引号转义，用于拼接远端 shell 命令
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
