use crate::error::{Error, Result};

fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(())
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

/// The index metric. The out-of-scope threshold is calibrated against it.
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> Result<f32> {
    check_dims(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum())
}

/// Element-wise mean. `None` for an empty input.
pub fn mean_vector<'a, I>(vectors: I) -> Result<Option<Vec<f32>>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum: Option<Vec<f32>> = None;
    let mut count = 0usize;
    for v in vectors {
        match sum.as_mut() {
            None => sum = Some(v.to_vec()),
            Some(acc) => {
                check_dims(acc, v)?;
                acc.iter_mut().zip(v).for_each(|(a, x)| *a += x);
            }
        }
        count += 1;
    }
    Ok(sum.map(|mut acc| {
        let n = count as f32;
        acc.iter_mut().for_each(|a| *a /= n);
        acc
    }))
}
