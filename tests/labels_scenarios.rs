use chrono::NaiveDate;
use coupon_roi::{build_labels, LabelConfig, LabelError, LabelRecord, Receipt, Transaction, MISSING_ID};

fn day(raw: &str) -> Option<NaiveDate> {
    raw.parse().ok()
}

fn receipt(key: i64, user: i64, coupon: i64, receive: &str, start: &str, end: &str) -> Receipt {
    Receipt {
        receipt_key: key,
        user_id: user,
        coupon_id: coupon,
        receive_date: day(receive),
        start_date: day(start),
        end_date: day(end),
        price_limit: Some(1_000),
        coupon_amount: Some(100),
        coupon_status: Some(1),
    }
}

fn txn(key: i64, user: i64, coupon: i64, pay: &str) -> Transaction {
    Transaction::new(key, user, coupon, day(pay), Some(100), Some(900))
}

fn labels(receipts: &[Receipt], txns: &[Transaction]) -> Vec<LabelRecord> {
    build_labels(receipts, txns, &LabelConfig::default())
        .expect("labels should build")
        .0
}

#[test]
fn happy_path_redeems_in_both_windows() {
    let out = labels(
        &[receipt(1, 1, 9001, "2023-01-09", "2023-01-09", "2023-01-15")],
        &[txn(1, 1, 9001, "2023-01-10")],
    );
    let r = &out[0];

    assert_eq!(r.start_eff, day("2023-01-09"));
    assert_eq!(r.end_eff, day("2023-01-15"));
    assert_eq!(r.short_end, day("2023-01-15"));
    assert!(r.label_same_user_fh);
    assert!(r.label_same_user_st);
    assert!(r.label_valid());
    assert_eq!(r.same_user_valid_txn_count, 1);
    assert_eq!(r.first_valid_txn_key, Some(1));
    assert_eq!(r.first_valid_txn_time, day("2023-01-10"));
}

#[test]
fn long_window_is_truncated_for_short_term_label() {
    let out = labels(
        &[receipt(1, 1, 9001, "2023-01-01", "2023-01-01", "2023-02-28")],
        &[txn(1, 1, 9001, "2023-01-18")],
    );
    let r = &out[0];

    assert_eq!(r.short_end, day("2023-01-16"));
    assert!(r.label_same_user_fh);
    assert!(!r.label_same_user_st);
    assert!(r.label_valid());
}

#[test]
fn other_user_without_own_receipt_marks_cross_user() {
    let out = labels(
        &[receipt(1, 1, 9001, "2023-05-05", "2023-05-05", "2023-05-15")],
        &[txn(1, 2, 9001, "2023-05-10")],
    );
    let r = &out[0];

    assert_eq!(r.other_user_in_window_txn_count, 1);
    assert_eq!(r.other_user_without_own_receipt_txn_count, 1);
    assert!(r.flag_cross_user);
    assert!(!r.label_valid());
    assert!(!r.label_same_user_fh);
}

#[test]
fn other_user_with_covering_receipt_is_not_cross_user() {
    let out = labels(
        &[
            receipt(1, 1, 9001, "2023-05-05", "2023-05-05", "2023-05-15"),
            receipt(2, 2, 9001, "2023-05-08", "2023-05-05", "2023-05-15"),
        ],
        &[txn(1, 2, 9001, "2023-05-10")],
    );

    let owner = &out[0];
    assert_eq!(owner.other_user_in_window_txn_count, 1);
    assert_eq!(owner.other_user_without_own_receipt_txn_count, 0);
    assert!(!owner.flag_cross_user);
    assert!(owner.label_valid());

    let other = &out[1];
    assert!(other.label_same_user_fh);
    assert_eq!(other.other_user_in_window_txn_count, 0);
}

#[test]
fn early_counts_sum_both_conditions_and_late_counts_after_end() {
    let out = labels(
        &[receipt(1, 1, 9001, "2023-01-10", "2023-01-05", "2023-01-20")],
        &[
            txn(1, 1, 9001, "2023-01-03"),
            txn(2, 1, 9001, "2023-01-06"),
            txn(3, 1, 9001, "2023-01-08"),
            txn(4, 1, 9001, "2023-01-25"),
        ],
    );
    let r = &out[0];

    assert_eq!(r.start_eff, day("2023-01-10"));
    assert_eq!(r.same_user_early_txn_count, 3);
    assert_eq!(r.same_user_late_txn_count, 1);
    assert!(r.flag_early);
    assert!(r.flag_late);
    assert!(!r.label_same_user_fh);
    assert_eq!(r.same_user_valid_txn_count, 0);
    assert_eq!(r.first_valid_txn_key, None);
    assert!(!r.label_valid());
}

#[test]
fn in_window_use_after_receive_is_not_early() {
    let out = labels(
        &[receipt(1, 1, 9001, "2023-01-10", "2023-01-05", "2023-01-20")],
        &[txn(1, 1, 9001, "2023-01-06"), txn(2, 1, 9001, "2023-01-12")],
    );
    let r = &out[0];

    assert_eq!(r.same_user_early_txn_count, 0);
    assert!(!r.flag_early);
    assert!(r.label_same_user_fh);
    assert_eq!(r.same_user_valid_txn_count, 1);
    assert_eq!(r.first_valid_txn_key, Some(2));
}

#[test]
fn structurally_invalid_receipts_are_flagged_not_dropped() {
    let out = labels(
        &[
            receipt(1, 1, 9001, "2023-01-01", "", "2023-01-31"),
            receipt(2, 1, 9002, "2023-01-01", "2023-01-10", "2023-01-05"),
            receipt(3, MISSING_ID, 9003, "2023-01-01", "2023-01-01", "2023-01-31"),
            receipt(4, 1, MISSING_ID, "2023-01-01", "2023-01-01", "2023-01-31"),
        ],
        &[txn(1, 1, 9001, "2023-01-05"), txn(2, 1, 9002, "2023-01-07")],
    );

    assert_eq!(out.len(), 4);
    for r in &out {
        assert!(r.flag_struc_invalid, "receipt {}", r.receipt_key);
        assert!(!r.label_valid());
    }
    assert!(!out[0].label_same_user_fh);
    assert_eq!(out[0].start_eff, None);
    assert!(!out[1].label_same_user_fh);
}

#[test]
fn one_transaction_can_satisfy_overlapping_receipts() {
    let out = labels(
        &[
            receipt(1, 1, 9001, "2023-01-01", "2023-01-01", "2023-01-31"),
            receipt(2, 1, 9001, "2023-01-10", "2023-01-10", "2023-01-20"),
        ],
        &[txn(9, 1, 9001, "2023-01-15"), txn(4, 1, 9001, "2023-01-15")],
    );

    assert!(out.iter().all(|r| r.label_same_user_fh && r.label_same_user_st));
    assert!(out.iter().all(|r| r.first_valid_txn_key == Some(4)));
    assert!(out.iter().all(|r| r.same_user_valid_txn_count == 2));
}

#[test]
fn invariants_hold_and_thread_count_does_not_change_results() {
    let receipts: Vec<Receipt> = (0..40)
        .map(|i| {
            let user = i % 5;
            let coupon = 9000 + i % 3;
            let receive = NaiveDate::from_ymd_opt(2023, 1, 1 + (i as u32 % 20)).unwrap();
            let start = NaiveDate::from_ymd_opt(2023, 1, 1 + (i as u32 % 7)).unwrap();
            let end = NaiveDate::from_ymd_opt(2023, 1, 10 + (i as u32 % 18)).unwrap();
            Receipt {
                receipt_key: i,
                user_id: user,
                coupon_id: coupon,
                receive_date: Some(receive),
                start_date: Some(start),
                end_date: Some(end),
                price_limit: Some(1_000),
                coupon_amount: Some(100),
                coupon_status: Some(1),
            }
        })
        .collect();
    let txns: Vec<Transaction> = (0..60)
        .map(|i| {
            let pay = NaiveDate::from_ymd_opt(2023, 1, 1 + (i as u32 % 28)).unwrap();
            Transaction::new(i, i % 6, 9000 + i % 3, Some(pay), Some(100), Some(900))
        })
        .collect();

    let single = build_labels(&receipts, &txns, &LabelConfig { short_window_days: 15, threads: 1 })
        .expect("single-threaded labels should build");
    let pooled = build_labels(&receipts, &txns, &LabelConfig { short_window_days: 15, threads: 4 })
        .expect("pooled labels should build");
    assert_eq!(single, pooled);

    let (rows, report) = single;
    assert_eq!(
        rows.iter().map(|r| r.receipt_key).collect::<Vec<_>>(),
        (0..40i64).collect::<Vec<_>>()
    );
    for r in &rows {
        if r.label_same_user_st {
            assert!(r.label_same_user_fh);
        }
        let any_flag = r.flag_early || r.flag_late || r.flag_cross_user || r.flag_struc_invalid;
        assert_eq!(r.label_valid(), !any_flag);
    }
    assert_eq!(report.receipts, 40);
    assert_eq!(report.valid, rows.iter().filter(|r| r.label_valid()).count() as u64);
}

#[test]
fn duplicate_receipt_keys_are_rejected() {
    let r = receipt(1, 1, 9001, "2023-01-01", "2023-01-01", "2023-01-31");
    let err = build_labels(&[r.clone(), r], &[], &LabelConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        LabelError::DuplicateKey {
            table: "receipt",
            key: 1
        }
    ));
}
