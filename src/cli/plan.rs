//! Offline chain planning.

use console::style;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::icons::{dim_arrow, success};
use crate::chain::{Chain, ChainBuilder, Mode};
use crate::config::Config;

pub fn cmd_plan(config: &Config, mode: Mode, seed: Option<u64>) -> anyhow::Result<()> {
    if !mode.uses_chain() {
        anyhow::bail!("{} mode routes through the daemon; there is no chain to plan", mode);
    }

    let pool = config.server_pool()?;
    if pool.is_empty() {
        anyhow::bail!("No servers configured. Add a `servers` list to your config file.");
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let chain = ChainBuilder::build(mode, &pool, &mut rng)?;

    println!(
        "{} {} chain from {} candidates",
        success(),
        style(mode).bold(),
        pool.len()
    );
    for line in render(&chain) {
        println!("  {}", line);
    }
    println!("  {} {}", dim_arrow(), chain.describe());
    Ok(())
}

fn render(chain: &Chain) -> Vec<String> {
    chain
        .hops()
        .iter()
        .enumerate()
        .map(|(i, hop)| {
            let mut line = format!(
                "{:>2}. {:<6} {:<11} {}",
                i,
                hop.role,
                hop.protocol,
                hop.address()
            );
            if let Some(ref country) = hop.country {
                line.push_str(&format!(" [{}]", country));
            }
            if hop.obfuscated {
                line.push_str(" obfuscated");
            }
            line.push_str(&format!(" tier={:?}", hop.tier).to_lowercase());
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Protocol, ProxyHop};

    #[test]
    fn test_render_marks_roles() {
        let hops = vec![
            ProxyHop::new(Protocol::Socks5, "10.0.0.1", 1080).with_country("de"),
            ProxyHop::new(Protocol::Shadowsocks, "10.0.0.2", 8388),
        ];
        let chain = Chain::new(Mode::Custom, hops).unwrap();
        let lines = render(&chain);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("entry"));
        assert!(lines[0].contains("[DE]"));
        assert!(lines[1].contains("exit"));
        assert!(lines[1].contains("10.0.0.2:8388"));
    }
}
