mod common;

use anyhow::Result;

use common::{GatewayCall, context, context_with, minutes};
use turnstile::clock::Clock;
use turnstile::config::EngineConfig;
use turnstile::gateway::GatewayError;

#[test]
fn admission_happens_only_after_the_delay() -> Result<()> {
    let ctx = context()?;
    let delay = minutes(10);

    ctx.engine.admissions.enqueue("carol")?;

    ctx.clock.advance(minutes(5));
    let early = ctx.engine.admissions.sweep_ready(ctx.clock.now(), delay)?;
    assert_eq!(early.candidates, 0);
    assert_eq!(ctx.gateway.count(&GatewayCall::Admit("carol".to_string())), 0);
    assert_eq!(
        ctx.engine.admissions.wait_remaining("carol")?,
        Some(minutes(5))
    );

    ctx.clock.advance(minutes(6));
    let due = ctx.engine.admissions.sweep_ready(ctx.clock.now(), delay)?;
    assert_eq!(due.candidates, 1);
    assert_eq!(due.succeeded, 1);
    assert_eq!(ctx.gateway.count(&GatewayCall::Admit("carol".to_string())), 1);
    assert_eq!(ctx.engine.admissions.wait_remaining("carol")?, None);
    Ok(())
}

#[test]
fn re_enqueueing_returns_the_pending_request_unchanged() -> Result<()> {
    let ctx = context()?;

    let first = ctx.engine.admissions.enqueue("carol")?;
    ctx.clock.advance(minutes(3));
    let second = ctx.engine.admissions.enqueue("carol")?;

    assert_eq!(first.id, second.id);
    assert_eq!(first.requested_at, second.requested_at);
    assert_eq!(ctx.engine.summary().admissions_pending, 1);
    Ok(())
}

#[test]
fn concurrent_enqueues_create_a_single_pending_request() -> Result<()> {
    let ctx = context()?;

    let records: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let admissions = &ctx.engine.admissions;
                s.spawn(move || admissions.enqueue("dave"))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("enqueue thread panicked"))
            .collect()
    });

    let ids: std::collections::HashSet<String> = records
        .into_iter()
        .map(|r| r.expect("enqueue failed").id)
        .collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(ctx.engine.summary().admissions_pending, 1);
    Ok(())
}

#[test]
fn ready_requests_are_admitted_oldest_first() -> Result<()> {
    let ctx = context()?;

    ctx.engine.admissions.enqueue("first")?;
    ctx.clock.advance(minutes(1));
    ctx.engine.admissions.enqueue("second")?;
    ctx.clock.advance(minutes(1));
    ctx.engine.admissions.enqueue("third")?;

    ctx.clock.advance(minutes(30));
    let report = ctx
        .engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;
    assert_eq!(report.succeeded, 3);
    assert_eq!(
        ctx.gateway.admitted(),
        vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string()
        ]
    );
    Ok(())
}

#[test]
fn failed_admissions_stay_pending_until_they_succeed() -> Result<()> {
    let ctx = context()?;
    ctx.gateway.fail_admit("erin", GatewayError::Denied);

    ctx.engine.admissions.enqueue("erin")?;
    ctx.clock.advance(minutes(11));

    let report = ctx
        .engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_subjects, vec!["erin".to_string()]);
    assert_eq!(ctx.engine.summary().admissions_pending, 1);

    // Admission is the only desired effect, so even a terminal-looking
    // failure is retried on the next sweep.
    ctx.gateway.clear_failures();
    let retry = ctx
        .engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;
    assert_eq!(retry.succeeded, 1);
    assert_eq!(ctx.gateway.count(&GatewayCall::Admit("erin".to_string())), 2);
    assert_eq!(ctx.engine.summary().admissions_processed, 1);
    Ok(())
}

#[test]
fn a_second_sweep_admits_nobody_new() -> Result<()> {
    let ctx = context()?;

    ctx.engine.admissions.enqueue("carol")?;
    ctx.clock.advance(minutes(11));
    ctx.engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;

    let second = ctx
        .engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;
    assert_eq!(second.candidates, 0);
    assert_eq!(ctx.gateway.count(&GatewayCall::Admit("carol".to_string())), 1);
    Ok(())
}

#[test]
fn one_failing_subject_does_not_block_the_others() -> Result<()> {
    let ctx = context()?;
    ctx.gateway.fail_admit("second", GatewayError::Timeout);

    ctx.engine.admissions.enqueue("first")?;
    ctx.clock.advance(minutes(1));
    ctx.engine.admissions.enqueue("second")?;
    ctx.clock.advance(minutes(1));
    ctx.engine.admissions.enqueue("third")?;

    ctx.clock.advance(minutes(30));
    let report = ctx
        .engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(
        ctx.gateway.admitted(),
        vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string()
        ]
    );
    assert_eq!(ctx.engine.summary().admissions_pending, 1);
    Ok(())
}

#[test]
fn cleanup_drops_only_old_processed_requests() -> Result<()> {
    let cfg = EngineConfig::default();
    let retention = cfg.retention();
    let ctx = context_with(cfg)?;

    // carol gets processed now; frank stays pending forever.
    ctx.engine.admissions.enqueue("carol")?;
    ctx.engine.admissions.enqueue("frank")?;
    ctx.gateway.fail_admit("frank", GatewayError::Timeout);
    ctx.clock.advance(minutes(11));
    ctx.engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;

    // A fresh processed request that must survive the cleanup.
    ctx.clock.advance(time::Duration::days(31));
    ctx.engine.admissions.enqueue("grace")?;
    ctx.clock.advance(minutes(11));
    ctx.engine
        .admissions
        .sweep_ready(ctx.clock.now(), minutes(10))?;

    let deleted = ctx.engine.admissions.cleanup_old(ctx.clock.now(), retention)?;
    assert_eq!(deleted, 1);

    let summary = ctx.engine.summary();
    assert_eq!(summary.admissions_pending, 1);
    assert_eq!(summary.admissions_processed, 1);
    Ok(())
}
