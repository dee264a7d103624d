//! Collect MX records for a seed list of popular russian domains and
//! suggest patterns for `ROUTING_RU_MX_PATTERNS`.

use mx_router::{HickoryMxResolver, MxResolver};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

// Large media, banks, retail, government services and hosters.
const SEED_DOMAINS: &[&str] = &[
    "yandex.ru",
    "ya.ru",
    "mail.ru",
    "bk.ru",
    "inbox.ru",
    "list.ru",
    "rambler.ru",
    "lenta.ru",
    "gazeta.ru",
    "kommersant.ru",
    "rbc.ru",
    "vc.ru",
    "vedomosti.ru",
    "sostav.ru",
    "proactivity.ru",
    "gosuslugi.ru",
    "sber.ru",
    "sberbank.ru",
    "tbank.ru",
    "tinkoff.ru",
    "wildberries.ru",
    "ozon.ru",
    "hh.ru",
    "pochta.ru",
    "russianpost.ru",
    "runity.ru",
    "timeweb.ru",
    "mchost.ru",
    "spaceweb.ru",
    "beget.ru",
    "beget.com",
    "reg.ru",
    "nic.ru",
    "selectel.ru",
    "selectel.org",
    "netangels.ru",
    "sprinthost.ru",
    "masterhost.ru",
    "1c.ru",
    "aeroflot.ru",
    "vtb.ru",
    "vtb.com",
    "alfabank.ru",
    "sovcombank.ru",
    "rosatom.ru",
    "roscosmos.ru",
    "mos.ru",
    "nornickel.ru",
    "magnit.ru",
    "x5.ru",
    "lukoil.ru",
    "lukoil.com",
    "tatneft.ru",
    "gazprom.ru",
    "novatek.ru",
    "megafon.ru",
    "mts.ru",
    "beeline.ru",
    "rt.ru",
    "facct.ru",
    "facct.email",
    "lancloud.ru",
    "sevstar.net",
];

/// Base zone of an MX host (`mx3.timeweb.ru` → `timeweb.ru`),
/// accounting for second-level zones like `co.ru`.
fn base_zone(hostname: &str) -> String {
    let chunks: Vec<&str> = hostname.split('.').collect();
    if chunks.len() < 2 {
        return hostname.to_string();
    }
    let second = chunks[chunks.len() - 2];
    let last = chunks[chunks.len() - 1];
    if chunks.len() >= 3
        && matches!(second, "co" | "com" | "org" | "net")
        && matches!(last, "ru" | "su")
    {
        chunks[chunks.len() - 3..].join(".")
    } else {
        chunks[chunks.len() - 2..].join(".")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let resolver = HickoryMxResolver::system(Duration::from_secs(3))?;

    let mut mx_hosts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut zones: BTreeSet<String> = BTreeSet::new();

    for domain in SEED_DOMAINS {
        let hosts = match resolver.resolve_mx(domain).await {
            Ok(hosts) => hosts,
            Err(err) => {
                eprintln!("[warn] MX lookup failed for {domain}: {err}");
                continue;
            }
        };
        for host in hosts {
            if host.is_empty() {
                continue;
            }
            zones.insert(base_zone(&host));
            mx_hosts.entry(host).or_default().insert(domain.to_string());
        }
    }

    println!("# MX hosts and the seed domains they serve");
    println!("{}", serde_json::to_string_pretty(&mx_hosts)?);
    println!();
    println!("# Base zones (suggested ROUTING_RU_MX_PATTERNS)");
    println!("{}", zones.into_iter().collect::<Vec<_>>().join(","));

    Ok(())
}
