//! Chain composition. Pure: no I/O, randomness injected by the caller.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use super::{Chain, ChainError, Mode, ProxyHop, SecurityTier};

/// Countries excluded from paranoid chains (Fourteen Eyes).
pub const SURVEILLANCE_ALLIANCE: [&str; 14] = [
    "US", "GB", "CA", "AU", "NZ", "DK", "FR", "NL", "NO", "BE", "DE", "IT", "ES", "SE",
];

/// Middle hops added by stealth mode.
const STEALTH_MIDDLES: std::ops::RangeInclusive<usize> = 1..=2;

/// Builds chains from a candidate pool according to a [`Mode`].
pub struct ChainBuilder;

impl ChainBuilder {
    /// Compose a chain for `mode`.
    ///
    /// `pool` is the candidate list; for [`Mode::Custom`] it is the exact,
    /// ordered chain the caller wants.
    pub fn build<R: Rng + ?Sized>(
        mode: Mode,
        pool: &[ProxyHop],
        rng: &mut R,
    ) -> Result<Chain, ChainError> {
        let candidates = dedupe(pool);
        if candidates.is_empty() && mode != Mode::Paranoid {
            return Err(ChainError::BuildFailed("candidate pool is empty".into()));
        }

        let hops = match mode {
            Mode::Turbo => turbo(candidates, rng)?,
            Mode::Custom => candidates,
            Mode::Ghost => ghost(candidates, rng),
            Mode::Stealth => stealth(candidates, rng),
            Mode::Paranoid => paranoid(candidates, rng)?,
            Mode::DaemonBacked => {
                return Err(ChainError::BuildFailed(
                    "daemon-backed mode does not use a proxy chain".into(),
                ))
            }
        };

        let chain = finish(mode, hops)?;
        debug!("Built {} chain: {}", mode, chain.describe());
        Ok(chain)
    }

    /// Keep every hop but the exit and pick a new exit from `pool`.
    pub fn replace_exit<R: Rng + ?Sized>(
        chain: &Chain,
        pool: &[ProxyHop],
        rng: &mut R,
    ) -> Result<Chain, ChainError> {
        let mode = chain.mode();
        let kept = &chain.hops()[..chain.len() - 1];
        let in_chain: HashSet<&str> = chain.hops().iter().map(|h| h.id.as_str()).collect();

        let mut candidates: Vec<ProxyHop> = dedupe(pool)
            .into_iter()
            .filter(|h| !in_chain.contains(h.id.as_str()))
            .filter(|h| match mode {
                Mode::Turbo => h.protocol.is_low_latency(),
                Mode::Paranoid => is_safe_country(h),
                _ => true,
            })
            .collect();
        if candidates.is_empty() {
            return Err(ChainError::BuildFailed(
                "no replacement exit available".into(),
            ));
        }
        candidates.shuffle(rng);

        let used: HashSet<&str> = kept.iter().filter_map(|h| h.country.as_deref()).collect();
        let pick = match mode {
            Mode::Ghost => candidates
                .iter()
                .position(|h| h.country.as_deref().is_some_and(|c| !used.contains(c))),
            Mode::Stealth => candidates.iter().position(|h| h.protocol.is_high_throughput()),
            _ => None,
        }
        .unwrap_or(0);

        let mut hops: Vec<ProxyHop> = kept.to_vec();
        hops.push(candidates.swap_remove(pick));
        finish(mode, hops)
    }
}

fn dedupe(pool: &[ProxyHop]) -> Vec<ProxyHop> {
    let mut seen = HashSet::new();
    pool.iter()
        .filter(|h| seen.insert(h.id.clone()))
        .cloned()
        .collect()
}

fn is_safe_country(hop: &ProxyHop) -> bool {
    // Unknown jurisdiction counts as unsafe.
    hop.country
        .as_deref()
        .is_some_and(|c| !SURVEILLANCE_ALLIANCE.contains(&c.to_uppercase().as_str()))
}

fn pick_count<R: Rng + ?Sized>(mode: Mode, available: usize, rng: &mut R) -> usize {
    let range = mode.hop_range();
    rng.gen_range(range).min(available)
}

fn turbo<R: Rng + ?Sized>(candidates: Vec<ProxyHop>, rng: &mut R) -> Result<Vec<ProxyHop>, ChainError> {
    let mut fast: Vec<ProxyHop> = candidates
        .into_iter()
        .filter(|h| h.protocol.is_low_latency())
        .collect();
    if fast.is_empty() {
        return Err(ChainError::BuildFailed(
            "no low-latency servers in pool".into(),
        ));
    }
    fast.shuffle(rng);
    fast.truncate(*Mode::Turbo.hop_range().end());
    Ok(fast)
}

/// Greedy country diversity: each slot takes the first remaining hop from an
/// unused country, or any hop once every country is used.
fn ghost<R: Rng + ?Sized>(mut candidates: Vec<ProxyHop>, rng: &mut R) -> Vec<ProxyHop> {
    let count = pick_count(Mode::Ghost, candidates.len(), rng);
    candidates.shuffle(rng);

    let mut used = HashSet::new();
    let mut chosen = Vec::with_capacity(count);
    while chosen.len() < count {
        let idx = candidates
            .iter()
            .position(|h| h.country.as_ref().is_some_and(|c| !used.contains(c)))
            .unwrap_or(0);
        let hop = candidates.remove(idx);
        if let Some(ref c) = hop.country {
            used.insert(c.clone());
        }
        chosen.push(hop);
    }
    chosen
}

fn stealth<R: Rng + ?Sized>(mut candidates: Vec<ProxyHop>, rng: &mut R) -> Vec<ProxyHop> {
    candidates.shuffle(rng);

    let entry_idx = candidates.iter().position(|h| h.obfuscated).unwrap_or(0);
    let entry = candidates.remove(entry_idx);
    if candidates.is_empty() {
        return vec![entry];
    }

    let exit_idx = candidates
        .iter()
        .position(|h| h.protocol.is_high_throughput())
        .unwrap_or(0);
    let exit = candidates.remove(exit_idx);

    let middles = rng.gen_range(STEALTH_MIDDLES).min(candidates.len());
    let mut hops = Vec::with_capacity(middles + 2);
    hops.push(entry);
    hops.extend(candidates.into_iter().take(middles));
    hops.push(exit);
    hops
}

fn paranoid<R: Rng + ?Sized>(candidates: Vec<ProxyHop>, rng: &mut R) -> Result<Vec<ProxyHop>, ChainError> {
    let mut safe: Vec<ProxyHop> = candidates.into_iter().filter(is_safe_country).collect();
    if safe.is_empty() {
        return Err(ChainError::NoSafeServers);
    }
    let count = pick_count(Mode::Paranoid, safe.len(), rng);
    safe.shuffle(rng);
    safe.truncate(count);
    Ok(safe)
}

/// Apply the mode's obfuscation and tier defaults, then assign roles.
fn finish(mode: Mode, hops: Vec<ProxyHop>) -> Result<Chain, ChainError> {
    let hops = hops
        .into_iter()
        .map(|hop| {
            let hop = match mode.obfuscation() {
                Some(flag) => hop.with_obfuscation(flag),
                None => hop,
            };
            if mode == Mode::Paranoid {
                hop.with_tier(SecurityTier::Maximum)
            } else {
                hop
            }
        })
        .collect();
    Chain::new(mode, hops)
}
