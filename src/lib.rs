pub mod aggregate;
pub mod classify;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod harvester;
pub mod ledger;
pub mod store;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
