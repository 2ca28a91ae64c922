//! Completion detection
//!
//! A pipeline-final shard collapses its output to the single selected token.
//! Generation is over when that token is the end-of-sequence id.

use crate::tensor::Tensor;

/// True iff `output` holds exactly one element equal to `eos_token_id`.
pub fn is_finished(output: &Tensor, eos_token_id: u32) -> bool {
    output
        .single_value()
        .map(|value| value == eos_token_id as f32)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 2;

    #[test]
    fn test_single_eos_is_finished() {
        assert!(is_finished(&Tensor::from_vec(vec![2.0]), EOS));

        let batched = Tensor::new(vec![2.0], vec![1, 1]).unwrap();
        assert!(is_finished(&batched, EOS));
    }

    #[test]
    fn test_single_other_token_is_not_finished() {
        assert!(!is_finished(&Tensor::from_vec(vec![3.0]), EOS));
        assert!(!is_finished(&Tensor::from_vec(vec![2.5]), EOS));
    }

    #[test]
    fn test_multiple_elements_never_finished() {
        assert!(!is_finished(&Tensor::from_vec(vec![2.0, 2.0]), EOS));
        let all_eos = Tensor::new(vec![2.0; 4], vec![2, 2]).unwrap();
        assert!(!is_finished(&all_eos, EOS));
    }

    #[test]
    fn test_empty_output_not_finished() {
        assert!(!is_finished(&Tensor::from_vec(vec![]), EOS));
    }
}
