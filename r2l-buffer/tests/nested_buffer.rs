use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use r2l_buffer::{BufferError, Index, NestedBuffer, Selector};

// 4 time slots, 6 simulators, values encode their own position
fn rollout_like() -> Result<NestedBuffer> {
    let device = Device::Cpu;
    let observations = NestedBuffer::new()
        .with(
            "depth",
            Tensor::arange(0f32, 48., &device)?.reshape((4, 6, 2))?,
        )
        .with(
            "goal",
            Tensor::arange(100i64, 124, &device)?.reshape((4, 6, 1))?,
        );
    Ok(NestedBuffer::new()
        .with("observations", observations)
        .with(
            "rewards",
            Tensor::arange(0f32, 24., &device)?.reshape((4, 6, 1))?,
        )
        .with("masks", Tensor::ones((4, 6, 1), DType::U8, &device)?))
}

fn assert_same(a: &NestedBuffer, b: &NestedBuffer) -> Result<()> {
    assert_eq!(a.keys(), b.keys());
    for ((path, left), (_, right)) in a.leaves().into_iter().zip(b.leaves()) {
        assert_eq!(left.dims(), right.dims(), "{path}");
        let left = left.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let right = right.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        assert_eq!(left, right, "{path}");
    }
    Ok(())
}

#[test]
fn get_applies_selector_to_every_leaf() -> Result<()> {
    let buffer = rollout_like()?;
    let slot = buffer.get(Selector::new(2usize, 1..4))?;
    assert_eq!(slot.leaf("observations.depth")?.dims(), &[3, 2]);
    assert_eq!(slot.leaf("observations.goal")?.dims(), &[3, 1]);
    assert_eq!(slot.leaf("rewards")?.dims(), &[3, 1]);
    assert_eq!(
        slot.leaf("rewards")?.flatten_all()?.to_vec1::<f32>()?,
        vec![13., 14., 15.]
    );

    let column = buffer.get(Selector::new(0..2, vec![5usize, 0]))?;
    assert_eq!(column.leaf("masks")?.dims(), &[2, 2, 1]);
    assert_eq!(
        column.leaf("rewards")?.flatten_all()?.to_vec1::<f32>()?,
        vec![5., 0., 11., 6.]
    );
    Ok(())
}

#[test]
fn get_then_set_restores_the_region() -> Result<()> {
    let selectors = [
        Selector::time(1usize),
        Selector::new(0..3, 2..5),
        Selector::new(Index::Full, 4usize),
        Selector::new(3usize, vec![1usize, 3, 5]),
        Selector::new(1..4, vec![4usize, 0]),
    ];
    for selector in selectors {
        let mut buffer = rollout_like()?;
        let original = buffer.clone();
        let region = buffer.get(selector.clone())?;
        let zeros = region.map(|t| t.zeros_like())?;
        buffer.set(selector.clone(), &zeros, true)?;
        assert_same(&buffer.get(selector.clone())?, &zeros)?;
        buffer.set(selector, &region, true)?;
        assert_same(&buffer, &original)?;
    }
    Ok(())
}

#[test]
fn strict_set_requires_the_full_key_set() -> Result<()> {
    let mut buffer = rollout_like()?;
    let partial =
        NestedBuffer::new().with("rewards", Tensor::ones((6, 1), DType::F32, &Device::Cpu)?);
    let err = buffer.set(0usize, &partial, true).unwrap_err();
    assert!(matches!(err, BufferError::KeyMismatch { .. }));
    Ok(())
}

#[test]
fn non_strict_set_only_touches_present_keys() -> Result<()> {
    let mut buffer = rollout_like()?;
    let original = buffer.clone();
    let partial = NestedBuffer::new()
        .with("rewards", Tensor::full(-1f32, (2, 1), &Device::Cpu)?)
        .with("unknown", Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?);
    buffer.set(Selector::new(3usize, 4..6), &partial, false)?;

    let rewards = buffer.leaf("rewards")?.to_vec3::<f32>()?;
    assert_eq!(rewards[3][4][0], -1.);
    assert_eq!(rewards[3][5][0], -1.);
    assert_eq!(rewards[3][3][0], 21.);
    assert_same(
        &buffer.get(Selector::time(0..3))?,
        &original.get(Selector::time(0..3))?,
    )?;
    assert_eq!(buffer.keys(), original.keys());
    Ok(())
}

#[test]
fn nested_groups_are_written_partially() -> Result<()> {
    let mut buffer = rollout_like()?;
    let observations =
        NestedBuffer::new().with("goal", Tensor::full(7i64, (6, 1), &Device::Cpu)?);
    let values = NestedBuffer::new().with("observations", observations);
    buffer.set(1usize, &values, false)?;
    let goal = buffer.leaf("observations.goal")?.to_vec3::<i64>()?;
    assert!(goal[1].iter().all(|g| g[0] == 7));
    assert_eq!(goal[0][0][0], 100);
    let depth = buffer.leaf("observations.depth")?.to_vec3::<f32>()?;
    assert_eq!(depth[1][0], vec![12., 13.]);
    Ok(())
}

#[test]
fn set_casts_to_the_destination_dtype() -> Result<()> {
    let mut buffer = rollout_like()?;
    let values = NestedBuffer::new().with("masks", Tensor::zeros((6, 1), DType::F32, &Device::Cpu)?);
    buffer.set(2usize, &values, false)?;
    let masks = buffer.leaf("masks")?;
    assert_eq!(masks.dtype(), DType::U8);
    assert_eq!(masks.sum_all()?.to_dtype(DType::U32)?.to_scalar::<u32>()?, 18);
    Ok(())
}

#[test]
fn failed_set_leaves_buffer_untouched() -> Result<()> {
    let mut buffer = rollout_like()?;
    let original = buffer.clone();
    // rewards is valid, depth has the wrong feature width
    let observations =
        NestedBuffer::new().with("depth", Tensor::zeros((6, 3), DType::F32, &Device::Cpu)?);
    let values = NestedBuffer::new()
        .with("rewards", Tensor::zeros((6, 1), DType::F32, &Device::Cpu)?)
        .with("observations", observations);
    let err = buffer.set(0usize, &values, false).unwrap_err();
    assert!(matches!(err, BufferError::ShapeMismatch { .. }));
    assert_same(&buffer, &original)?;
    Ok(())
}

#[test]
fn selectors_past_the_end_are_rejected() -> Result<()> {
    let mut buffer = rollout_like()?;
    assert!(matches!(
        buffer.get(4usize),
        Err(BufferError::OutOfRange { dim: 0, .. })
    ));
    let slot = buffer.get(0usize)?;
    assert!(matches!(
        buffer.set(Selector::new(0usize, vec![6usize]), &slot, false),
        Err(BufferError::OutOfRange { dim: 1, .. })
    ));
    Ok(())
}

#[test]
fn map_in_place_preserves_tree_and_leading_dims() -> Result<()> {
    let mut buffer = rollout_like()?;
    let keys = buffer.keys();
    buffer.map_in_place(|t| t.to_device(&Device::Cpu)?.to_dtype(DType::F64))?;
    assert_eq!(buffer.keys(), keys);
    assert_eq!(buffer.leading_dims()?, (4, 6));
    assert!(buffer.leaves().iter().all(|(_, t)| t.dtype() == DType::F64));

    let err = buffer.map_in_place(|t| t.flatten(0, 1)).unwrap_err();
    assert!(matches!(err, BufferError::ShapeMismatch { .. }));
    assert_eq!(buffer.leading_dims()?, (4, 6));
    Ok(())
}

#[test]
fn map_builds_new_tree() -> Result<()> {
    let buffer = rollout_like()?;
    let flat = buffer.map(|t| t.flatten(0, 1))?;
    assert_eq!(flat.keys(), buffer.keys());
    assert_eq!(flat.leaf("observations.depth")?.dims(), &[24, 2]);
    assert_eq!(buffer.leaf("observations.depth")?.dims(), &[4, 6, 2]);
    Ok(())
}

#[test]
fn copy_slot_moves_a_timestep_across_leaves() -> Result<()> {
    let mut buffer = rollout_like()?;
    let expected = buffer.get(3usize)?;
    buffer.copy_slot(0, 3)?;
    assert_same(&buffer.get(0usize)?, &expected)?;
    assert_same(&buffer.get(3usize)?, &expected)?;
    Ok(())
}
