//! Simulates a user typing Pokémon names into a search box.
//!
//! Each keystroke requests a resource through a [`ResourceSlot`]; repeated names
//! are served from the cache, and entries disappear once nobody has asked for them
//! for a full TTL.
//!
//! Run with `RUST_LOG=rescache=debug cargo run --example pokemon_lookup`.

use std::sync::Arc;
use std::time::Duration;

use rescache::{
    CacheConfig, ResourceCache, ResourceSlot, ResourceState, TransitionConfig, TransitionOutcome,
};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Pokemon {
    name: String,
    number: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("no pokemon named {0:?}")]
struct UnknownPokemon(String);

const POKEDEX: &[(&str, u32)] = &[
    ("bulbasaur", 1),
    ("charmander", 4),
    ("squirtle", 7),
    ("pikachu", 25),
    ("mew", 151),
];

async fn fetch_pokemon(name: String) -> Result<Pokemon, UnknownPokemon> {
    // Pretend the network is slow.
    sleep(Duration::from_millis(400)).await;
    POKEDEX
        .iter()
        .find(|(known, _)| *known == name)
        .map(|&(name, number)| Pokemon {
            name: name.to_owned(),
            number,
        })
        .ok_or(UnknownPokemon(name))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CacheConfig::from_env()?;
    let cache: Arc<ResourceCache<Pokemon, UnknownPokemon>> = Arc::new(ResourceCache::new(config)?);
    cache.start();

    let fetch = |name: &str| fetch_pokemon(name.to_owned());
    let mut slot = ResourceSlot::new(
        Arc::clone(&cache),
        Arc::new(fetch),
        TransitionConfig::default(),
    );

    for query in ["Pika", "Pikachu", "", "PIKACHU", "Mew", "Missingno", "mew"] {
        let Some(resource) = slot.request(query) else {
            info!("search box cleared");
            continue;
        };

        match resource.read() {
            ResourceState::Pending => info!(query, "loading"),
            ResourceState::Resolved(pokemon) => info!(query, ?pokemon, "served from cache"),
            ResourceState::Rejected(e) => info!(query, error = %e, "cached failure"),
        }

        match slot.await_current().await {
            Some(TransitionOutcome::Settled(Ok(pokemon))) => {
                info!(name = %pokemon.name, number = pokemon.number, "found");
            }
            Some(TransitionOutcome::Settled(Err(e))) => info!(error = %e, "lookup failed"),
            Some(TransitionOutcome::TimedOut) => info!("still loading, showing fallback"),
            None => {}
        }
    }

    info!(keys = ?cache.keys(), stats = ?cache.stats(), "before expiry");
    sleep(cache.ttl() + cache.config().sweep_interval * 2).await;
    info!(keys = ?cache.keys(), stats = ?cache.stats(), "after expiry");

    cache.stop().await;
    Ok(())
}
