//! Statistics reduced across real multi-participant groups.

use std::sync::Arc;
use std::thread;

use tally_group::{Communicator, CoordinatedGroup, GroupConfig, SingleProcess};
use tally_stats::{compute, compute1, print_root, PrintOptions, StatRecord, Status};

fn run_group<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(CoordinatedGroup) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let members = CoordinatedGroup::in_process(size, GroupConfig::default()).unwrap();
    let handles = members
        .into_iter()
        .map(|member| {
            let f = f.clone();
            thread::spawn(move || f(member))
        })
        .collect::<Vec<_>>();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn three_participants() {
    let out = run_group(3, |g| {
        let value = [2.0, 4.0, 6.0][g.rank()];
        let mut records = vec![StatRecord::from_value(value).with_label("x")];
        compute(&g, &mut records).unwrap();
        records.remove(0)
    });

    for r in &out {
        assert_eq!(r.status, Status::Reduced);
        assert_eq!(r.count, 3);
        assert_eq!(r.sum_values, 12.0);
        assert_eq!(r.average, 4.0);
        assert!((r.variance - 8.0 / 3.0).abs() < 1e-12);
        assert_eq!((r.min, r.min_at_rank), (2.0, 0));
        assert_eq!((r.max, r.max_at_rank), (6.0, 2));
        assert_eq!(r.label.as_deref(), Some("x"));
    }
    // Everyone holds bit-identical results.
    assert!(out.iter().all(|r| r.variance.to_bits() == out[0].variance.to_bits()));
}

#[test]
fn ties_resolve_to_lowest_rank() {
    let out = run_group(4, |g| {
        let rank = g.rank();
        // Ranks 1 and 3 share the minimum of the first variable.
        let first = [5.0, -1.0, 9.0, -1.0][rank];
        let second = if rank >= 2 { 3.0 } else { 0.0 };
        let mut records = vec![StatRecord::from_value(first), StatRecord::from_value(second)];
        compute(&g, &mut records).unwrap();
        records
    });
    for records in out {
        assert_eq!((records[0].min_at_rank, records[0].max_at_rank), (1, 2));
        assert_eq!((records[1].min_at_rank, records[1].max_at_rank), (0, 2));
    }
}

#[test]
fn counts_add_up() {
    let out = run_group(3, |g| {
        let rank = g.rank();
        let mut record = StatRecord::new();
        for i in 0..=rank {
            record.push(i as f64);
        }
        let mut records = vec![record];
        compute(&g, &mut records).unwrap();
        records.remove(0)
    });
    for r in out {
        assert_eq!(r.count, 1 + 2 + 3);
        assert_eq!(r.sum_values, 0.0 + 1.0 + 3.0);
        assert_eq!((r.min, r.min_at_rank), (0.0, 0));
        assert_eq!((r.max, r.max_at_rank), (2.0, 2));
    }
}

#[test]
fn identical_samples_have_no_spread() {
    for size in 3..=9 {
        let out = run_group(size, |g| {
            let mut records = [0.1, 0.3, 1.1].map(StatRecord::from_value).to_vec();
            compute(&g, &mut records).unwrap();
            records
        });
        for records in out {
            for (r, v) in records.iter().zip([0.1, 0.3, 1.1]) {
                assert_eq!(r.count, size as u64);
                assert_eq!(r.average, v, "{v} over {size}");
                assert_eq!(r.variance, 0.0, "{v} over {size}");
                assert_eq!(r.relative_deviation(), Some(0.0));
            }
        }
    }
}

#[test]
fn nobody_has_samples() {
    let out = run_group(2, |g| {
        let mut records = vec![StatRecord::new()];
        compute(&g, &mut records).unwrap();
        records.remove(0)
    });
    for r in out {
        assert_eq!(r.status, Status::Empty);
        assert!(!r.has_data());
        assert!(r.average.is_nan() && r.standard_deviation.is_nan());
    }
}

#[test]
fn compute1_takes_sum_as_value() {
    let out = run_group(2, |g| {
        let rank = g.rank();
        let mut records = vec![StatRecord::from_accumulated(50, rank as f64 + 1.0, 0.0, 0.0, 0.0)];
        compute1(&g, &mut records).unwrap();
        records.remove(0)
    });
    for r in out {
        assert_eq!(r.count, 2);
        assert_eq!(r.average, 1.5);
        assert_eq!(r.variance, 0.25);
    }
}

#[test]
fn single_matches_one_member_group() {
    let seed = || {
        vec![
            StatRecord::from_accumulated(5, 0.1 + 0.2, 0.7, -0.3, 1e-9),
            StatRecord::from_value(std::f64::consts::PI),
        ]
    };

    let mut single = seed();
    compute(&SingleProcess::new(), &mut single).unwrap();

    let coordinated = run_group(1, move |g| {
        let mut records = seed();
        compute(&g, &mut records).unwrap();
        records
    })
    .remove(0);

    for (a, b) in single.iter().zip(&coordinated) {
        for (x, y) in [
            (a.average, b.average),
            (a.variance, b.variance),
            (a.standard_deviation_of_mean, b.standard_deviation_of_mean),
            (a.min, b.min),
            (a.max, b.max),
        ] {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }
}

#[test]
fn report_only_on_root() {
    let out = run_group(2, |g| {
        let mut records = vec![StatRecord::from_value(1.0)];
        compute(&g, &mut records).unwrap();
        let mut buf = Vec::new();
        print_root(&g, &records, PrintOptions::new(false, true), Some(&mut buf)).unwrap();
        String::from_utf8(buf).unwrap()
    });
    assert!(out[0].ends_with("Summary = [ 1 ];\n"));
    assert!(out[1].is_empty());
}
