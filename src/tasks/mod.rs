pub mod reconcile_sweep;
