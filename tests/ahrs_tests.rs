use approx::assert_abs_diff_eq;
use cubesat_flight::ahrs::AttitudeEstimator;
use cubesat_flight::config::AhrsConfig;
use nalgebra::Vector3;
use std::time::Duration;

fn norm(q: [f64; 4]) -> f64 {
    q.iter().map(|c| c * c).sum::<f64>().sqrt()
}

#[test]
fn test_quaternion_stays_unit_under_motion() {
    let mut ahrs = AttitudeEstimator::new(4.5, 1.0, 0.05);

    for step in 0..2000 {
        let t = f64::from(step) * 0.05;
        let gyro = Vector3::new(0.8 * t.sin(), -0.5 * (0.3 * t).cos(), 1.2);
        let accel = Vector3::new(0.2 * t.cos(), 0.1, 0.95);
        let mag = Vector3::new(30.0, -4.0 * t.sin(), -40.0);

        ahrs.update(gyro, accel, mag);
        assert_abs_diff_eq!(norm(ahrs.quaternion()), 1.0, epsilon = 1e-6);
    }
}

#[test]
fn test_stationary_attitude_is_stable() {
    let mut ahrs = AttitudeEstimator::new(4.5, 1.0, 0.05);
    let gyro = Vector3::zeros();
    let accel = Vector3::new(0.0, 0.0, 1.0);
    let mag = Vector3::new(22.0, 5.0, -42.0);

    for _ in 0..10 {
        ahrs.update(gyro, accel, mag);
    }
    let settled = ahrs.euler_degrees();

    for _ in 0..500 {
        ahrs.update(gyro, accel, mag);
        let angles = ahrs.euler_degrees();
        assert_abs_diff_eq!(angles.roll_deg, settled.roll_deg, epsilon = 0.1);
        assert_abs_diff_eq!(angles.pitch_deg, settled.pitch_deg, epsilon = 0.1);
        assert_abs_diff_eq!(angles.yaw_deg, settled.yaw_deg, epsilon = 0.1);
    }

    assert_abs_diff_eq!(settled.roll_deg, 0.0, epsilon = 0.1);
    assert_abs_diff_eq!(settled.pitch_deg, 0.0, epsilon = 0.1);
}

#[test]
fn test_tilted_gravity_converges() {
    let mut ahrs = AttitudeEstimator::new(4.5, 1.0, 0.05);
    // Gravity seen along +y: rolled by 90 degrees
    let accel = Vector3::new(0.0, 1.0, 0.0);

    for _ in 0..2000 {
        ahrs.update(Vector3::zeros(), accel, Vector3::zeros());
    }

    let angles = ahrs.euler_degrees();
    assert_abs_diff_eq!(angles.roll_deg.abs(), 90.0, epsilon = 1.0);
    assert_abs_diff_eq!(angles.pitch_deg, 0.0, epsilon = 1.0);
}

#[test]
fn test_estimators_do_not_share_state() {
    let mut moving = AttitudeEstimator::new(4.5, 1.0, 0.05);
    let still = AttitudeEstimator::new(4.5, 1.0, 0.05);

    for _ in 0..100 {
        moving.update(
            Vector3::new(0.5, 0.2, 0.1),
            Vector3::new(0.3, 0.0, 0.9),
            Vector3::zeros(),
        );
    }

    assert_eq!(still.quaternion(), [1.0, 0.0, 0.0, 0.0]);
    assert_eq!(still.integral_error(), Vector3::zeros());
    assert_ne!(moving.quaternion(), still.quaternion());
}

#[test]
fn test_zero_accel_skips_normalization() {
    let mut ahrs = AttitudeEstimator::new(4.5, 1.0, 0.05);
    ahrs.update(Vector3::zeros(), Vector3::zeros(), Vector3::zeros());

    assert_eq!(ahrs.quaternion(), [1.0, 0.0, 0.0, 0.0]);
    assert_eq!(ahrs.last_magnetic(), Vector3::zeros());
}

#[test]
fn test_non_finite_input_keeps_previous_attitude() {
    let mut ahrs = AttitudeEstimator::new(4.5, 1.0, 0.05);
    ahrs.update(Vector3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.0), Vector3::zeros());
    let before = ahrs.quaternion();

    ahrs.update(Vector3::new(f64::NAN, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.0), Vector3::zeros());

    assert_eq!(ahrs.quaternion(), before);
    assert!(ahrs.integral_error().iter().all(|v| v.is_finite()));
}

#[test]
fn test_half_period_from_interval() {
    let ahrs = AttitudeEstimator::with_interval(&AhrsConfig::default(), Duration::from_millis(100));
    assert_abs_diff_eq!(ahrs.half_period(), 0.05, epsilon = 1e-12);
}

#[test]
fn test_yaw_rate_integrates() {
    // 0.5 rad/s about z for 1 s at 10 Hz; gravity aligned so no correction
    let mut ahrs = AttitudeEstimator::with_interval(&AhrsConfig::default(), Duration::from_millis(100));
    for _ in 0..10 {
        ahrs.update(Vector3::new(0.0, 0.0, 0.5), Vector3::new(0.0, 0.0, 1.0), Vector3::zeros());
    }
    assert_abs_diff_eq!(ahrs.euler_degrees().yaw_deg, 0.5f64.to_degrees(), epsilon = 0.5);
}
