//! End-to-end walk through the marketplace: a drop-off is confirmed, picked
//! up, weighed and completed, the owner rates the bank and withdraws part of
//! the payout.
//!
//! Run with `RECYCLE_LOG=debug cargo run --example walkthrough` for more detail.
use anyhow::Context;
use recycle_rewards::{
    LogObserver, Marketplace, NewSubmission, Page, PayoutDestination, PickupDetails, Settings, Settlement,
    SledCatalog, Transition, TransitionRequest, WasteBank, WasteType, telemetry,
};
use rust_decimal::Decimal;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    telemetry::init();

    let settings = Settings::load(None).context("loading settings")?;
    let db = Arc::new(
        sled::open(&settings.storage_path).with_context(|| format!("opening {}", settings.storage_path))?,
    );

    let catalog = SledCatalog::open(&db)?;
    catalog.upsert_bank(&WasteBank {
        id: "bank_melati".into(),
        name: "Bank Sampah Melati".into(),
        is_active: true,
    })?;
    catalog.upsert_waste_type(&WasteType {
        id: "pet".into(),
        name: "Botol PET".into(),
        category: "plastic".into(),
        price_per_kg: Decimal::from(3000).into(),
        is_active: true,
    })?;

    let market = Marketplace::new(db.clone(), catalog, settings)?.with_observer(Arc::new(LogObserver));

    let user = "user_sari";
    let submission = market.create_submission(NewSubmission {
        user_id: user.into(),
        bank_id: "bank_melati".into(),
        waste_type_id: "pet".into(),
        declared_weight: Decimal::new(200, 1),
        photos: vec!["/uploads/submissions/pet-bags.jpg".into()],
        description: Some("four bags of bottles".into()),
    })?;
    println!("created {} estimated at {}", submission.code, submission.estimated_value);

    let steps = [
        (Transition::Confirm { note: None }, "admin_rina"),
        (
            Transition::PickUp(PickupDetails {
                time_slot: Some("08:00-10:00".into()),
                ..PickupDetails::new("Jl. Kenanga 12, Bandung")
            }),
            "courier_joko",
        ),
        (
            Transition::Process {
                actual_weight: Decimal::new(215, 1),
                notes: Some("two bags were wet".into()),
            },
            "operator_dewi",
        ),
        (Transition::Complete, "operator_dewi"),
    ];
    for (transition, actor) in steps {
        if let Transition::Process { actual_weight, .. } = &transition {
            let check = market.check_weight(&submission.id, *actual_weight)?;
            println!(
                "weight deviation {}% (tolerance {}%)",
                check.deviation_percentage, check.tolerance_percentage
            );
        }
        let current = market.submission(&submission.id)?;
        let updated = market.transition_submission(
            &submission.id,
            TransitionRequest::new(transition, actor).at_version(current.version),
        )?;
        println!("{} is now {}", updated.code, updated.status);
    }

    market.rate_submission(&submission.id, user, 5, Some("on time".into()))?;
    let rating = market.bank_rating("bank_melati")?;
    println!("bank_melati rated {} over {} reviews", rating.average, rating.count);

    let balance = market.get_balance(user)?;
    println!("balance after payout: {balance}");

    if balance >= market.settings().min_withdrawal_amount {
        let withdrawal = market.request_withdrawal(
            user,
            market.settings().min_withdrawal_amount,
            &PayoutDestination {
                bank_name: "BRI".into(),
                account_number: "0012345678".into(),
                account_name: "Sari Wulandari".into(),
            },
        )?;
        market.settle_withdrawal(&withdrawal.id, Settlement::Completed)?;
    }

    for entry in market.list_ledger_history(user, Page::default())? {
        println!(
            "{} {:?} {:>12} -> {:>12} ({})",
            entry.code, entry.kind, entry.amount, entry.balance_after, entry.status
        );
    }

    let audit = market.verify_ledger(user)?;
    println!("ledger verified: {} entries, balance {}", audit.entries, audit.balance);

    db.flush()?;
    Ok(())
}
