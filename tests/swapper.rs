//! Swap-out worker integration tests

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{
    next_report, wait_until, GatedReactivation, LimitedIsolation, OverReporting, PanicOnReclaim, ReactivateAll,
};
use tiermem::{
    CycleOutcome, Domain, DomainConfig, FaultError, FaultOutcome, InvariantViolation, MemTier, Reclaimer,
    RetryReason, SimulatedReclaimer, WorkerState,
};

fn paused_domain<R: Reclaimer<u64>>(config: DomainConfig, reclaimer: R) -> Domain<u64> {
    let domain = Domain::new();
    domain.pause();
    domain.init(config, reclaimer).unwrap();
    domain
}

fn fill(domain: &Domain<u64>, pages: u64) {
    for key in 1..=pages {
        assert_eq!(domain.on_fault(key * 8, 0x1000 + key, key, 1), Ok(FaultOutcome::Admitted));
    }
}

fn assert_conserved(domain: &Domain<u64>) {
    let pool = domain.free_pool().unwrap();
    assert_eq!(
        domain.local_count() as u32 + pool.free_pages + pool.under_reclaim,
        pool.total_pages,
        "local + free + under_reclaim must equal capacity"
    );
}

mod scenario {
    use super::*;

    /// Capacity 3, watermark 2. Three admissions drain the pool, a fourth
    /// fault is bounced, and the worker frees exactly one page because the
    /// primitive only isolates one victim.
    #[test]
    fn test_drain_then_single_victim_cycle() {
        let domain = paused_domain(DomainConfig::new(3, 2).with_seed(7), LimitedIsolation::new(1));
        let reports = domain.cycle_reports();

        fill(&domain, 3);
        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 0);
        assert_eq!(pool.under_reclaim, 0);

        let wakeups = domain.stats().wakeups;
        assert_eq!(
            domain.on_fault(0x100, 0x2000, 0x20, 1),
            Err(FaultError::Retry(RetryReason::NoFreePages))
        );
        assert!(domain.stats().wakeups > wakeups);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.cycle, 1);
        assert_eq!(report.free_pages, 0);
        assert_eq!(report.shortfall, 2);
        assert_eq!(report.target, 2);
        assert_eq!(report.selected, 1);
        assert_eq!(report.spurious, 2);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.reactivated, 0);
        assert_eq!(report.outcome, CycleOutcome::Progress);

        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 1);
        assert_eq!(pool.under_reclaim, 0);
        assert_eq!(domain.remote_count(), 1);
        assert_eq!(domain.local_count(), 2);

        // Every later cycle finds nothing isolatable and changes nothing.
        let report = next_report(&reports);
        assert_eq!(report.outcome, CycleOutcome::Abandoned);
        assert_eq!(domain.free_pool().unwrap().free_pages, 1);
        assert_conserved(&domain);
    }
}

mod convergence {
    use super::*;

    #[test]
    fn test_free_pages_restored_to_watermark() {
        let domain = paused_domain(
            DomainConfig::new(1000, 100).with_seed(3),
            SimulatedReclaimer::new(Some(3)),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 1000);
        assert_eq!(domain.free_pool().unwrap().free_pages, 0);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.target, 100);
        assert_eq!(report.selected, 100);
        assert_eq!(report.reclaimed, 100);

        assert!(wait_until(|| domain.worker_state() == WorkerState::Idle));
        let pool = domain.free_pool().unwrap();
        assert!(pool.free_pages >= 100);
        assert_eq!(domain.remote_count(), 100);
        assert_conserved(&domain);

        let stats = domain.stats();
        assert_eq!(stats.pages_selected, 100);
        assert_eq!(stats.isolated_inactive_anon + stats.isolated_active_anon, 100);
    }

    #[test]
    fn test_max_batch_spreads_over_cycles() {
        let domain = paused_domain(
            DomainConfig::new(200, 50).with_seed(5).with_max_batch(20),
            SimulatedReclaimer::new(Some(5)),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 200);

        domain.resume();
        for _ in 0..3 {
            let report = next_report(&reports);
            assert!(report.selected <= 20);
        }
        assert!(wait_until(|| domain.worker_state() == WorkerState::Idle));
        assert!(domain.free_pool().unwrap().free_pages >= 50);
        assert!(domain.stats().cycles_completed >= 3);
        assert_conserved(&domain);
    }

    #[test]
    fn test_selection_gives_up_after_max_attempts() {
        let domain = paused_domain(
            DomainConfig::new(8, 4)
                .with_seed(21)
                .with_max_selection_attempts(3)
                .with_backoff_us(100, 1000),
            SimulatedReclaimer::new(Some(21)).with_isolate_failures(1.0),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 8);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.target, 4);
        assert_eq!(report.spurious, 3);
        assert_eq!(report.selected, 0);
        assert_eq!(report.submitted, 0);
        assert_eq!(report.outcome, CycleOutcome::Abandoned);

        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 0);
        assert_eq!(pool.under_reclaim, 0);
        assert_eq!(domain.local_count(), 8);
        assert_eq!(domain.remote_count(), 0);
        assert!(domain.stats().spurious_victims >= 3);
    }

    #[test]
    fn test_huge_pages_are_never_victims() {
        let domain = paused_domain(
            DomainConfig::new(4, 2).with_seed(9).with_backoff_us(100, 1000),
            SimulatedReclaimer::new(Some(9)),
        );
        let reports = domain.cycle_reports();
        for key in 1..=4u64 {
            domain.on_fault(key * 8, key, key, 2).unwrap();
        }

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.outcome, CycleOutcome::Abandoned);
        assert_eq!(report.selected, 0);
        assert_eq!(domain.remote_count(), 0);
        assert_eq!(domain.free_pool().unwrap().free_pages, 0);
    }
}

mod promotion {
    use super::*;

    #[test]
    fn test_remote_page_faults_back_in() {
        let domain = paused_domain(
            DomainConfig::new(4, 2).with_seed(11).with_network_delay_us(25),
            LimitedIsolation::new(2),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 4);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.reclaimed, 2);
        assert!(wait_until(|| domain.worker_state().is_parked()));

        let remote = domain
            .records()
            .into_iter()
            .find(|r| r.tier == MemTier::Remote)
            .unwrap();
        let free_before = domain.free_pool().unwrap().free_pages;
        assert_eq!(free_before, 2);

        assert_eq!(
            domain.on_fault(remote.entry_ref, remote.frame, remote.guest_frame_number, 1),
            Ok(FaultOutcome::Promoted)
        );
        assert_eq!(domain.lookup(&remote.entry_ref).unwrap().tier, MemTier::Local);
        assert_eq!(domain.free_pool().unwrap().free_pages, 1);

        let stats = domain.stats();
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.remote_latency_us, 25);
        assert_conserved(&domain);
    }

    #[test]
    fn test_removing_remote_page_credits_nothing() {
        let domain = paused_domain(DomainConfig::new(4, 2).with_seed(13), LimitedIsolation::new(2));
        let reports = domain.cycle_reports();
        fill(&domain, 4);
        domain.resume();
        next_report(&reports);
        assert!(wait_until(|| domain.worker_state().is_parked()));
        domain.pause();

        let remote = domain
            .records()
            .into_iter()
            .find(|r| r.tier == MemTier::Remote)
            .unwrap();
        let free_before = domain.free_pool().unwrap().free_pages;
        domain.remove(&remote.entry_ref).unwrap();
        assert_eq!(domain.free_pool().unwrap().free_pages, free_before);
        assert_conserved(&domain);
    }
}

mod reactivation {
    use super::*;

    #[test]
    fn test_reactivated_pages_return_to_local() {
        let domain = paused_domain(
            DomainConfig::new(8, 4).with_seed(17).with_backoff_us(100, 1000),
            ReactivateAll,
        );
        let reports = domain.cycle_reports();
        fill(&domain, 8);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.selected, 4);
        assert_eq!(report.reactivated, 4);
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.outcome, CycleOutcome::NoProgress);

        domain.pause();
        assert!(wait_until(|| domain.worker_state() == WorkerState::Paused));
        assert_eq!(domain.remote_count(), 0);
        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 0);
        assert_eq!(pool.under_reclaim, 0);
        assert!(domain.stats().pages_reactivated >= 4);
    }

    #[test]
    fn test_retained_pages_stay_in_flight() {
        let domain = paused_domain(
            DomainConfig::new(10, 5).with_seed(19).with_backoff_us(100, 1000),
            SimulatedReclaimer::new(Some(19)).with_ratios(0.0, 0.0),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 10);

        domain.resume();
        let first = next_report(&reports);
        assert_eq!(first.selected, 5);
        assert_eq!(first.retained, 5);
        assert_eq!(first.outcome, CycleOutcome::NoProgress);

        // Demand is already covered by the batch, so nothing new is selected.
        let second = next_report(&reports);
        assert_eq!(second.under_reclaim, 5);
        assert_eq!(second.target, 0);
        assert_eq!(second.selected, 0);
        assert_eq!(second.submitted, 5);

        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.under_reclaim, 5);
        assert_eq!(domain.remote_count(), 5);
        assert_conserved(&domain);
    }
}

mod pruning {
    use super::*;

    #[test]
    fn test_removed_leftover_is_pruned_and_credited() {
        let domain = paused_domain(
            DomainConfig::new(10, 5).with_seed(29).with_backoff_us(100, 1000),
            SimulatedReclaimer::new(Some(29)).with_ratios(0.0, 0.0),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 10);

        domain.resume();
        let first = next_report(&reports);
        assert_eq!(first.retained, 5);

        domain.pause();
        assert!(wait_until(|| domain.worker_state() == WorkerState::Paused));
        while reports.try_recv().is_ok() {}

        let remote = domain
            .records()
            .into_iter()
            .find(|r| r.tier == MemTier::Remote)
            .unwrap();
        domain.remove(&remote.entry_ref).unwrap();
        assert_eq!(domain.free_pool().unwrap().free_pages, 0);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.target, 0);
        assert_eq!(report.pruned, 1);
        assert_eq!(report.submitted, 4);
        assert_eq!(report.outcome, CycleOutcome::Progress);

        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 1);
        assert_eq!(pool.under_reclaim, 4);
        assert_eq!(domain.local_count(), 5);
        assert_eq!(domain.stats().pages_pruned, 1);
        assert_conserved(&domain);
    }

    #[test]
    fn test_promoted_leftover_is_pruned() {
        let domain = paused_domain(
            DomainConfig::new(10, 5).with_seed(31).with_backoff_us(100, 1000),
            SimulatedReclaimer::new(Some(31)).with_ratios(0.0, 0.0),
        );
        let reports = domain.cycle_reports();
        fill(&domain, 10);

        domain.resume();
        next_report(&reports);
        domain.pause();
        assert!(wait_until(|| domain.worker_state() == WorkerState::Paused));
        while reports.try_recv().is_ok() {}

        // Make room, then fault a queued page back in.
        let local = domain
            .records()
            .into_iter()
            .find(|r| r.tier == MemTier::Local)
            .unwrap();
        domain.remove(&local.entry_ref).unwrap();
        let remote = domain
            .records()
            .into_iter()
            .find(|r| r.tier == MemTier::Remote)
            .unwrap();
        assert_eq!(
            domain.on_fault(remote.entry_ref, remote.frame, remote.guest_frame_number, 1),
            Ok(FaultOutcome::Promoted)
        );
        assert_eq!(domain.free_pool().unwrap().free_pages, 0);

        domain.resume();
        let report = next_report(&reports);
        assert_eq!(report.pruned, 1);
        assert_eq!(report.submitted, 4);

        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 1);
        assert_eq!(pool.under_reclaim, 4);
        assert_conserved(&domain);
    }

    #[test]
    fn test_victim_removed_in_flight_returns_slot_on_reactivation() {
        let (primitive, submitted, release) = GatedReactivation::new();
        let domain = paused_domain(DomainConfig::new(8, 4).with_seed(37).with_backoff_us(100, 1000), primitive);
        let reports = domain.cycle_reports();
        fill(&domain, 8);

        domain.resume();
        let keys = submitted.recv_timeout(common::TIMEOUT).unwrap();
        assert_eq!(keys.len(), 4);
        domain.remove(&keys[0]).unwrap();
        release.send(()).unwrap();

        let report = next_report(&reports);
        assert_eq!(report.reactivated, 4);
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.outcome, CycleOutcome::Progress);

        domain.pause();
        assert!(wait_until(|| domain.worker_state() == WorkerState::Paused));
        let pool = domain.free_pool().unwrap();
        assert_eq!(pool.free_pages, 1);
        assert_eq!(pool.under_reclaim, 0);
        assert_eq!(domain.local_count(), 7);
        assert_eq!(domain.remote_count(), 0);
        assert!(domain.lookup(&keys[0]).is_none());
        assert_conserved(&domain);
    }
}

mod halting {
    use super::*;

    #[test]
    fn test_primitive_disagreement_halts_domain() {
        let domain = paused_domain(DomainConfig::new(2, 1).with_seed(23), OverReporting);
        fill(&domain, 2);

        domain.resume();
        assert!(wait_until(|| domain.worker_state() == WorkerState::Halted));
        assert!(matches!(
            domain.halt_reason(),
            Some(InvariantViolation::PrimitiveDisagreement { batch: 1, .. })
        ));

        match domain.on_fault(0x100, 1, 1, 1) {
            Err(FaultError::Fatal(InvariantViolation::PrimitiveDisagreement { .. })) => {}
            other => panic!("expected fatal fault, got {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_survives_worker_panic() {
        let panicked = Arc::new(AtomicBool::new(false));
        let domain = paused_domain(
            DomainConfig::new(2, 1).with_seed(41),
            PanicOnReclaim {
                panicked: Arc::clone(&panicked),
            },
        );
        fill(&domain, 2);

        domain.resume();
        assert!(wait_until(|| panicked.load(Ordering::SeqCst)));
        domain.shutdown();
        assert!(domain.halt_reason().is_none());
        assert_eq!(domain.len(), 2);
    }
}
