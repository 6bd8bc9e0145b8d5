use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use rand::Rng;
use regex::Regex;

use crate::prism::config;

/// The outcome of a successful route lookup.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub host: String,
    /// Candidate upstreams in dial order for this resolve.
    pub upstreams: Vec<String>,
    pub matched_pattern: String,
    /// Status ping cache TTL for this route; `None` disables caching.
    pub cache_ping_ttl: Option<Duration>,
}

/// Ordered route table published as an immutable compiled snapshot.
///
/// `update` swaps the whole snapshot atomically; `resolve` never locks.
pub struct Router {
    compiled: ArcSwap<CompiledRoutes>,
}

#[derive(Default)]
struct CompiledRoutes {
    routes: Vec<CompiledRoute>,
}

struct CompiledRoute {
    patterns: Vec<CompiledPattern>,
    upstreams: Vec<String>,
    strategy: Strategy,
    cache_ping_ttl: Option<Duration>,
    rr: AtomicU64,
}

struct CompiledPattern {
    pattern: String,
    exact: bool,
    re: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Sequential,
    Random,
    RoundRobin,
}

impl Router {
    pub fn new(routes: &[config::RouteConfig]) -> Self {
        let r = Self {
            compiled: ArcSwap::from_pointee(CompiledRoutes::default()),
        };
        r.update(routes);
        r
    }

    pub fn update(&self, routes: &[config::RouteConfig]) {
        let mut out = Vec::with_capacity(routes.len());
        for rt in routes {
            match compile_route(rt) {
                Ok(c) => out.push(c),
                Err(err) => {
                    tracing::warn!(err = %err, "router: skipping invalid route");
                }
            }
        }
        self.compiled.store(Arc::new(CompiledRoutes { routes: out }));
    }

    /// First match wins, by route order then in-route pattern order.
    pub fn resolve(&self, host: &str) -> Option<Resolution> {
        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        let cr = self.compiled.load();
        for rt in &cr.routes {
            for p in &rt.patterns {
                let Some(groups) = pattern_captures(&host, p) else {
                    continue;
                };

                let candidates = rt
                    .upstreams
                    .iter()
                    .map(|u| substitute_captures(u, &groups))
                    .collect();

                return Some(Resolution {
                    host: host.clone(),
                    upstreams: order_candidates(rt, candidates),
                    matched_pattern: p.pattern.clone(),
                    cache_ping_ttl: rt.cache_ping_ttl,
                });
            }
        }

        None
    }
}

fn compile_route(rt: &config::RouteConfig) -> anyhow::Result<CompiledRoute> {
    let mut patterns = Vec::new();
    for h in &rt.hosts {
        let h = h.trim().to_ascii_lowercase();
        if h.is_empty() {
            continue;
        }
        if !h.contains('*') && !h.contains('?') {
            patterns.push(CompiledPattern {
                pattern: h,
                exact: true,
                re: None,
            });
            continue;
        }
        let re = compile_glob(&h)?;
        patterns.push(CompiledPattern {
            pattern: h,
            exact: false,
            re: Some(re),
        });
    }
    if patterns.is_empty() {
        anyhow::bail!("route has no host patterns");
    }

    let upstreams: Vec<String> = rt
        .upstreams
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if upstreams.is_empty() {
        anyhow::bail!("route has no upstreams");
    }

    Ok(CompiledRoute {
        patterns,
        upstreams,
        strategy: parse_strategy(&rt.strategy),
        cache_ping_ttl: rt.cache_ping_ttl,
        rr: AtomicU64::new(0),
    })
}

fn parse_strategy(s: &str) -> Strategy {
    // Fold "Round-Robin", "round_robin", "round robin", ... onto one spelling
    // by keeping only the alphanumerics.
    let folded: String = s
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match folded.as_str() {
        "random" => Strategy::Random,
        "roundrobin" => Strategy::RoundRobin,
        _ => Strategy::Sequential,
    }
}

/// Glob to anchored regex: `*` becomes a non-greedy capture, `?` a single-char
/// capture, literal runs in between are regex-escaped wholesale.
pub fn compile_glob(pattern: &str) -> anyhow::Result<Regex> {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        anyhow::bail!("empty host pattern");
    }

    let mut re = String::with_capacity(pattern.len() + 8);
    let mut literal = String::new();
    re.push('^');
    for ch in pattern.chars() {
        if ch != '*' && ch != '?' {
            literal.push(ch);
            continue;
        }
        re.push_str(&regex::escape(&literal));
        literal.clear();
        re.push_str(if ch == '*' { "(.*?)" } else { "(.)" });
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');
    Ok(Regex::new(&re)?)
}

/// `Some(groups)` when the pattern matches; exact patterns capture nothing.
fn pattern_captures(host: &str, p: &CompiledPattern) -> Option<Vec<String>> {
    if p.exact {
        return (host == p.pattern).then(Vec::new);
    }
    let caps = p.re.as_ref()?.captures(host)?;
    Some(
        caps.iter()
            .skip(1)
            .map(|m| m.map_or_else(String::new, |m| m.as_str().to_owned()))
            .collect(),
    )
}

/// Replace `$N` placeholders with capture groups, highest index first so `$10`
/// is not clobbered by `$1`.
pub fn substitute_captures(template: &str, groups: &[String]) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    (1..=groups.len())
        .rev()
        .fold(template.to_string(), |acc, i| {
            acc.replace(&format!("${i}"), &groups[i - 1])
        })
}

fn order_candidates(rt: &CompiledRoute, candidates: Vec<String>) -> Vec<String> {
    let n = candidates.len();
    if n < 2 {
        return candidates;
    }
    let start = match rt.strategy {
        Strategy::Sequential => 0,
        Strategy::Random => rand::rng().random_range(0..n),
        Strategy::RoundRobin => rt.rr.fetch_add(1, Ordering::Relaxed) as usize % n,
    };
    rotate(candidates, start)
}

fn rotate(v: Vec<String>, start: usize) -> Vec<String> {
    let n = v.len();
    let pivot = if n == 0 { 0 } else { start % n };
    if pivot == 0 {
        return v;
    }
    let mut tail = v;
    let mut front = tail.split_off(pivot);
    front.append(&mut tail);
    front
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(hosts: &[&str], upstreams: &[&str], strategy: &str) -> config::RouteConfig {
        config::RouteConfig {
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            upstreams: upstreams.iter().map(|s| s.to_string()).collect(),
            strategy: strategy.into(),
            cache_ping_ttl: None,
        }
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let r = Router::new(&[route(&["Play.Example.Com"], &["10.0.0.1:25565"], "")]);
        let res = r.resolve("PLAY.example.com").expect("match");
        assert_eq!(res.upstreams, vec!["10.0.0.1:25565"]);
        assert_eq!(res.matched_pattern, "play.example.com");
        assert!(r.resolve("other.example.com").is_none());
    }

    #[test]
    fn wildcard_capture_substitution() {
        let r = Router::new(&[route(&["*.domain.com"], &["$1.servers.svc:25565"], "")]);
        let res = r.resolve("abc.domain.com").expect("match");
        assert_eq!(res.upstreams, vec!["abc.servers.svc:25565"]);
        // The bare apex does not match "*."-prefixed patterns.
        assert!(r.resolve("domain.com").is_none());
    }

    #[test]
    fn question_mark_matches_single_char() {
        let r = Router::new(&[route(&["node?.example.com"], &["backend-$1:1"], "")]);
        assert_eq!(
            r.resolve("node7.example.com").unwrap().upstreams,
            vec!["backend-7:1"]
        );
        assert!(r.resolve("node77.example.com").is_none());
    }

    #[test]
    fn multi_capture_substitution_high_to_low() {
        let r = Router::new(&[route(&["*.*.example.com"], &["$1$2.svc:1"], "")]);
        let res = r.resolve("a.b.example.com").unwrap();
        assert_eq!(res.upstreams, vec!["ab.svc:1"]);
    }

    #[test]
    fn first_route_wins_over_later_more_specific() {
        let r = Router::new(&[
            route(&["*.example.com"], &["wild:1"], ""),
            route(&["play.example.com"], &["exact:1"], ""),
        ]);
        assert_eq!(r.resolve("play.example.com").unwrap().upstreams, vec!["wild:1"]);
    }

    #[test]
    fn round_robin_advances_per_resolve() {
        let r = Router::new(&[route(&["h.example"], &["a:1", "b:1", "c:1"], "round-robin")]);
        let mut starts = Vec::new();
        for _ in 0..6 {
            starts.push(r.resolve("h.example").unwrap().upstreams[0].clone());
        }
        assert_eq!(starts, vec!["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn random_is_a_rotation() {
        let r = Router::new(&[route(&["h.example"], &["a:1", "b:1", "c:1"], "random")]);
        for _ in 0..16 {
            let got = r.resolve("h.example").unwrap().upstreams;
            assert!(
                got == ["a:1", "b:1", "c:1"]
                    || got == ["b:1", "c:1", "a:1"]
                    || got == ["c:1", "a:1", "b:1"],
                "unexpected order {got:?}"
            );
        }
    }

    #[test]
    fn update_swaps_table() {
        let r = Router::new(&[route(&["a.example.com"], &["127.0.0.1:1"], "")]);
        assert!(r.resolve("a.example.com").is_some());
        r.update(&[route(&["b.example.com"], &["127.0.0.1:2"], "")]);
        assert!(r.resolve("a.example.com").is_none());
        assert_eq!(
            r.resolve("b.example.com").unwrap().upstreams,
            vec!["127.0.0.1:2"]
        );
    }

    #[test]
    fn glob_escapes_regex_metachars() {
        let re = compile_glob("play.example.com").unwrap();
        assert!(re.is_match("play.example.com"));
        assert!(!re.is_match("playxexample.com"));
    }
}
