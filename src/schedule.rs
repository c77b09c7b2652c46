/// epoch at which the learning rate first drops
pub const FIRST_DECAY_EPOCH: u32 = 150;
/// epoch at which the learning rate drops again
pub const SECOND_DECAY_EPOCH: u32 = 225;

/// Piecewise constant learning rate, indexed by the 0-based epoch
pub fn decay(epoch: u32) -> f64 {
    if epoch < FIRST_DECAY_EPOCH {
        0.1
    } else if epoch < SECOND_DECAY_EPOCH {
        0.01
    } else {
        0.001
    }
}

#[test]
fn test_decay_boundaries() {
    assert_eq!(decay(0), 0.1);
    assert_eq!(decay(149), 0.1);
    assert_eq!(decay(150), 0.01);
    assert_eq!(decay(224), 0.01);
    assert_eq!(decay(225), 0.001);
    assert_eq!(decay(1000), 0.001);
}
