// tests/test_schedule.rs -- Schedule annotations and how lowering checks them.
//
// These run with `cargo test --test test_schedule`.
// A small two-stage pipeline, blur_x -> blur_y, under different schedules.

use tilepipe::buffer::Buffer;
use tilepipe::error::{DomainError, Error, ScheduleError};
use tilepipe::lower::{Placement, Site};
use tilepipe::target::{AcceleratorApi, Target};
use tilepipe::{clamp, Func, GraphBuilder, Pipeline, Var};

struct Blur {
    pipeline: Pipeline,
    blur_x: Func,
    blur_y: Func,
}

/// 3-tap box blur in x then y, over an i32 ramp.
fn blur(w: usize, h: usize) -> Blur {
    let mut g = GraphBuilder::new();
    let input = g
        .input(
            "input",
            Buffer::<i32>::from_fn(w, h, 1, |x, y, _| (x * 7 + y * 13) as i32 % 50),
        )
        .unwrap();
    let (x, y, c) = (Var::new("x"), Var::new("y"), Var::new("c"));
    let (wm, hm) = (w as i32 - 1, h as i32 - 1);
    let at = |dx: i32| input.at([clamp(&x + dx, 0, wm), clamp(&y, 0, hm), c.expr()]);
    let blur_x = g
        .stage("blur_x", &["x", "y", "c"], (at(-1) + at(0) + at(1)) / 3)
        .unwrap();
    let by = |dy: i32| blur_x.at([x.expr(), &y + dy, c.expr()]);
    let blur_y = g
        .stage("blur_y", &["x", "y", "c"], (by(-1) + by(0) + by(1)) / 3)
        .unwrap();
    Blur {
        pipeline: Pipeline::new(g.build(), blur_y),
        blur_x,
        blur_y,
    }
}

fn run(b: &mut Blur, w: usize, h: usize) -> Vec<i32> {
    let mut out = Buffer::<i32>::new(w, h, 1);
    b.pipeline.realize(&mut out).unwrap();
    out.ensure_host().unwrap();
    out.as_slice().unwrap().to_vec()
}

// ===== Equivalence =====

#[test]
fn granularities_agree() {
    let (w, h) = (13, 9);
    let expected = run(&mut blur(w, h), w, h);

    let mut root = blur(w, h);
    root.pipeline.schedule(root.blur_x).compute_root();
    assert_eq!(run(&mut root, w, h), expected);

    let mut per_row = blur(w, h);
    per_row.pipeline.schedule(per_row.blur_x).compute_at(per_row.blur_y, "y");
    assert_eq!(run(&mut per_row, w, h), expected);

    let mut window = blur(w, h);
    window
        .pipeline
        .schedule(window.blur_x)
        .store_root()
        .compute_at(window.blur_y, "y");
    assert_eq!(run(&mut window, w, h), expected);
}

#[test]
fn loop_structure_does_not_change_values() {
    let (w, h) = (21, 10);
    let expected = run(&mut blur(w, h), w, h);

    let mut b = blur(w, h);
    b.pipeline
        .schedule(b.blur_y)
        .split("y", "yo", "yi", 4)
        .unwrap()
        .parallel("yo")
        .unwrap()
        .vectorize("x", 8)
        .unwrap();
    b.pipeline
        .schedule(b.blur_x)
        .compute_at(b.blur_y, "yo")
        .vectorize("x", 4)
        .unwrap();
    assert_eq!(run(&mut b, w, h), expected);

    let mut t = blur(w, h);
    t.pipeline
        .schedule(t.blur_y)
        .tile("x", "y", "xo", "yo", "xi", "yi", 5, 3)
        .unwrap()
        .reorder(&["xi", "yi", "yo", "xo"])
        .unwrap();
    t.pipeline.schedule(t.blur_x).compute_at(t.blur_y, "xo");
    assert_eq!(run(&mut t, w, h), expected);
}

#[test]
fn device_tiles_agree_with_host() {
    let (w, h) = (17, 11);
    let expected = run(&mut blur(w, h), w, h);

    let mut b = blur(w, h);
    b.pipeline
        .set_target(Target::host().with_accelerator(AcceleratorApi::Cuda));
    b.pipeline
        .schedule(b.blur_y)
        .device_tile("x", "y", 4, 4)
        .unwrap();
    b.pipeline
        .schedule(b.blur_x)
        .compute_at_device_blocks(b.blur_y)
        .device_threads(&["x", "y"])
        .unwrap();
    assert_eq!(run(&mut b, w, h), expected);
}

// ===== Plan shape =====

#[test]
fn compute_at_resolves_to_a_loop_level() {
    let mut b = blur(8, 8);
    b.pipeline
        .schedule(b.blur_y)
        .split("y", "yo", "yi", 2)
        .unwrap();
    b.pipeline.schedule(b.blur_x).compute_at(b.blur_y, "yi");
    let plan = b.pipeline.compile().unwrap();
    // Loops of blur_y, outermost first: c, yo, yi, x.
    assert_eq!(
        plan.stage(b.blur_x.index()).compute,
        Site::At {
            consumer: b.blur_y.index(),
            level: 2
        }
    );
    assert_eq!(plan.order, vec![b.blur_x.index(), b.blur_y.index()]);
    assert_eq!(plan.placement_of("blur_y"), Some(Placement::InlineHost));
}

#[test]
fn only_parallel_loops_get_a_parallel_placement() {
    let mut b = blur(8, 8);
    b.pipeline.schedule(b.blur_x).compute_root();
    b.pipeline.schedule(b.blur_y).parallel("y").unwrap();
    let plan = b.pipeline.compile().unwrap();
    assert_eq!(plan.placement_of("blur_x"), Some(Placement::InlineHost));
    assert_eq!(plan.placement_of("blur_y"), Some(Placement::ParallelHost));
}

// ===== Rejections =====

#[test]
fn producer_outside_its_users_is_rejected() {
    let mut b = blur(8, 8);
    // blur_x computed per x of blur_y, but stored further in than computed.
    b.pipeline
        .schedule(b.blur_x)
        .compute_at(b.blur_y, "y")
        .store_at(b.blur_y, "x");
    assert!(matches!(
        b.pipeline.compile().unwrap_err(),
        Error::Schedule(ScheduleError::InvalidStoreLevel { .. })
    ));
}

#[test]
fn thread_loops_need_blocks() {
    let mut b = blur(8, 8);
    b.pipeline
        .set_target(Target::host().with_accelerator(AcceleratorApi::OpenCl));
    b.pipeline.schedule(b.blur_y).device_threads(&["x"]).unwrap();
    assert!(matches!(
        b.pipeline.compile().unwrap_err(),
        Error::Schedule(ScheduleError::DeviceBand { .. })
    ));
}

#[test]
fn parallel_inside_device_band_is_rejected() {
    let mut b = blur(8, 8);
    b.pipeline
        .set_target(Target::host().with_accelerator(AcceleratorApi::OpenCl));
    b.pipeline
        .schedule(b.blur_y)
        .device_blocks(&["y"])
        .unwrap()
        .parallel("x")
        .unwrap();
    assert!(matches!(
        b.pipeline.compile().unwrap_err(),
        Error::Schedule(ScheduleError::DeviceBand { .. })
    ));
}

#[test]
fn bound_smaller_than_output_is_a_violation() {
    let mut b = blur(8, 8);
    b.pipeline.schedule(b.blur_y).bound("x", 0, 4).unwrap();
    let mut out = Buffer::<i32>::new(8, 8, 1);
    assert!(matches!(
        b.pipeline.realize(&mut out).unwrap_err(),
        Error::Domain(DomainError::BoundViolation { .. })
    ));
}

#[test]
fn output_rank_must_match() {
    let mut b = blur(8, 8);
    let mut out = Buffer::<i32>::new(8, 8, 1);
    assert!(b.pipeline.realize(&mut out).is_ok());

    let mut g = GraphBuilder::new();
    let x = Var::new("x");
    let line = g.stage("line", &["x"], &x * 2).unwrap();
    let mut p = Pipeline::new(g.build(), line);
    let mut flat = Buffer::<i32>::new(4, 1, 1);
    p.realize(&mut flat).unwrap();
    assert_eq!(flat.as_slice().unwrap(), &[0, 2, 4, 6]);
    let mut square = Buffer::<i32>::new(4, 4, 1);
    assert!(matches!(
        p.realize(&mut square).unwrap_err(),
        Error::Domain(DomainError::RankMismatch { expected: 1, .. })
    ));
}
