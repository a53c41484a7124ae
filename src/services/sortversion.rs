//! 版本排序
//!
//! `parse_version`：类 PEP 440 的版本解析，无法解析的版本按旧式规则比较，且总是小于可解析的版本。
//! `vercmp`：pacman 的版本比较算法（epoch:version-release）。

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::VersionError;
use crate::models::RichResult;

/// 版本排序方式（条目配置 `sort_version_key`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionOrder {
    #[default]
    ParseVersion,
    Vercmp,
}

impl VersionOrder {
    pub fn from_name(name: &str) -> Result<Self, VersionError> {
        match name {
            "parse_version" => Ok(Self::ParseVersion),
            "vercmp" => Ok(Self::Vercmp),
            other => Err(VersionError::config(format!(
                "未知的 sort_version_key: {}",
                other
            ))),
        }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            Self::ParseVersion => parse_version(a).cmp(&parse_version(b)),
            Self::Vercmp => vercmp(a, b),
        }
    }

    /// 最大的版本；相等时取靠后的一个
    pub fn max<'a>(&self, versions: &'a [RichResult]) -> Option<&'a RichResult> {
        match self {
            Self::ParseVersion => versions
                .iter()
                .map(|v| (parse_version(&v.version), v))
                .max_by(|a, b| a.0.cmp(&b.0))
                .map(|(_, v)| v),
            Self::Vercmp => versions
                .iter()
                .max_by(|a, b| vercmp(&a.version, &b.version)),
        }
    }
}

/// 带正负无穷的比较值，变体顺序即比较顺序
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Bound<T> {
    NegInf,
    Val(T),
    PosInf,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalPart {
    Str(String),
    Num(u64),
}

/// 可排序的版本键；旧式版本总是小于标准版本
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionKey {
    Legacy(Vec<String>),
    Pep440 {
        epoch: u64,
        release: Vec<u64>,
        pre: Bound<(String, u64)>,
        post: Bound<u64>,
        dev: Bound<u64>,
        local: Bound<Vec<LocalPart>>,
    },
}

static PEP440: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^
        v?
        (?:(?P<epoch>\d+)!)?
        (?P<release>\d+(?:\.\d+)*)
        (?:[-_.]?(?P<pre_l>alpha|a|beta|b|preview|pre|c|rc)[-_.]?(?P<pre_n>\d+)?)?
        (?:-(?P<post_n1>\d+)|[-_.]?(?P<post_l>post|rev|r)[-_.]?(?P<post_n2>\d+)?)?
        (?:[-_.]?(?P<dev_l>dev)[-_.]?(?P<dev_n>\d+)?)?
        (?:\+(?P<local>[a-z0-9]+(?:[-_.][a-z0-9]+)*))?
        $",
    )
    .expect("静态正则表达式")
});

static LEGACY_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+|[a-z]+|\.|-").expect("静态正则表达式"));

fn num(s: Option<regex::Match<'_>>) -> u64 {
    // 超出 u64 的数字按最大值处理
    s.map_or(0, |m| m.as_str().parse().unwrap_or(u64::MAX))
}

/// 解析版本号为可比较的键
pub fn parse_version(version: &str) -> VersionKey {
    let trimmed = version.trim();
    let Some(caps) = PEP440.captures(trimmed) else {
        return legacy_key(trimmed);
    };

    let mut release: Vec<u64> = caps["release"]
        .split('.')
        .map(|p| p.parse().unwrap_or(u64::MAX))
        .collect();
    while release.len() > 1 && release.last() == Some(&0) {
        release.pop();
    }

    let pre = caps.name("pre_l").map(|l| {
        let phase = match l.as_str().to_ascii_lowercase().as_str() {
            "alpha" | "a" => "a",
            "beta" | "b" => "b",
            _ => "rc",
        };
        (phase.to_string(), num(caps.name("pre_n")))
    });
    let post = if caps.name("post_n1").is_some() {
        Some(num(caps.name("post_n1")))
    } else {
        caps.name("post_l").map(|_| num(caps.name("post_n2")))
    };
    let dev = caps.name("dev_l").map(|_| num(caps.name("dev_n")));
    let local = caps.name("local").map(|l| {
        l.as_str()
            .split(['-', '_', '.'])
            .map(|p| match p.parse::<u64>() {
                Ok(n) => LocalPart::Num(n),
                Err(_) => LocalPart::Str(p.to_ascii_lowercase()),
            })
            .collect::<Vec<_>>()
    });

    VersionKey::Pep440 {
        epoch: num(caps.name("epoch")),
        release,
        // 只有 dev 段时排在对应的预发布版本之前
        pre: match (&pre, post, dev) {
            (None, None, Some(_)) => Bound::NegInf,
            (None, _, _) => Bound::PosInf,
            (Some(p), _, _) => Bound::Val(p.clone()),
        },
        post: post.map_or(Bound::NegInf, Bound::Val),
        dev: dev.map_or(Bound::PosInf, Bound::Val),
        local: local.map_or(Bound::NegInf, Bound::Val),
    }
}

fn legacy_key(version: &str) -> VersionKey {
    let lower = version.to_ascii_lowercase();
    let raw = LEGACY_PART
        .find_iter(&lower)
        .filter_map(|m| {
            let part = match m.as_str() {
                "." => return None,
                "pre" | "preview" | "rc" => "c",
                "-" => "final-",
                "dev" => "@",
                other => other,
            };
            Some(if part.starts_with(|c: char| c.is_ascii_digit()) {
                format!("{:0>8}", part)
            } else {
                format!("*{}", part)
            })
        })
        .chain(std::iter::once("*final".to_string()));

    let mut parts: Vec<String> = Vec::new();
    for part in raw {
        if part.starts_with('*') {
            if part.as_str() < "*final" {
                while parts.last().is_some_and(|p| p == "*final-") {
                    parts.pop();
                }
            }
            while parts.last().is_some_and(|p| p == "00000000") {
                parts.pop();
            }
        }
        parts.push(part);
    }
    VersionKey::Legacy(parts)
}

/// pacman 风格的完整版本比较：先比较 epoch，再比较版本，最后在双方都有时比较 release
pub fn vercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let (e1, v1, r1) = parse_evr(a);
    let (e2, v2, r2) = parse_evr(b);
    rpmvercmp(e1, e2)
        .then_with(|| rpmvercmp(v1, v2))
        .then_with(|| match (r1, r2) {
            (Some(r1), Some(r2)) => rpmvercmp(r1, r2),
            _ => Ordering::Equal,
        })
}

fn parse_evr(evr: &str) -> (&str, &str, Option<&str>) {
    let digits = evr.bytes().take_while(u8::is_ascii_digit).count();
    let (epoch, rest) = if evr.as_bytes().get(digits) == Some(&b':') {
        let epoch = &evr[..digits];
        (if epoch.is_empty() { "0" } else { epoch }, &evr[digits + 1..])
    } else {
        ("0", evr)
    };
    match rest.rsplit_once('-') {
        Some((version, release)) => (epoch, version, Some(release)),
        None => (epoch, rest, None),
    }
}

/// 逐段比较版本字符串中的数字段与字母段
fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let one = a.as_bytes();
    let two = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    while i < one.len() && j < two.len() {
        let (start1, start2) = (i, j);
        while i < one.len() && !one[i].is_ascii_alphanumeric() {
            i += 1;
        }
        while j < two.len() && !two[j].is_ascii_alphanumeric() {
            j += 1;
        }
        if i >= one.len() || j >= two.len() {
            break;
        }
        // 分隔符长度不同
        if i - start1 != j - start2 {
            return (i - start1).cmp(&(j - start2));
        }

        let (seg1_start, seg2_start) = (i, j);
        let isnum = one[i].is_ascii_digit();
        let class: fn(&u8) -> bool = if isnum {
            u8::is_ascii_digit
        } else {
            u8::is_ascii_alphabetic
        };
        while i < one.len() && class(&one[i]) {
            i += 1;
        }
        while j < two.len() && class(&two[j]) {
            j += 1;
        }

        let mut seg1 = &a[seg1_start..i];
        let mut seg2 = &b[seg2_start..j];
        if seg2.is_empty() {
            return if isnum {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        if isnum {
            seg1 = seg1.trim_start_matches('0');
            seg2 = seg2.trim_start_matches('0');
            match seg1.len().cmp(&seg2.len()) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        match seg1.cmp(seg2) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    let rest1 = &one[i..];
    let rest2 = &two[j..];
    if rest1.is_empty() && rest2.is_empty() {
        return Ordering::Equal;
    }
    let alpha1 = rest1.first().is_some_and(u8::is_ascii_alphabetic);
    let alpha2 = rest2.first().is_some_and(u8::is_ascii_alphabetic);
    if (rest1.is_empty() && !alpha2) || alpha1 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}
