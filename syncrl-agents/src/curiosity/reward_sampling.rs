use rand::Rng;
use rand::seq::IndexedRandom;

/// Reward sign classes predicted by the auxiliary reward head.
pub const REWARD_CLASSES: usize = 3;

/// Class index of a reward: 0 for zero, 1 for positive, 2 for negative.
pub fn reward_class(reward: f32) -> usize {
    if reward > 0. {
        1
    } else if reward < 0. {
        2
    } else {
        0
    }
}

pub fn one_hot_reward(reward: f32) -> [f32; REWARD_CLASSES] {
    let mut one_hot = [0.; REWARD_CLASSES];
    one_hot[reward_class(reward)] = 1.;
    one_hot
}

/// Picks the `(t, env)` step whose state feeds the reward prediction loss.
///
/// The environment with the largest summed reward over the window is used. Zero and non zero
/// reward steps of that environment are drawn with equal probability; when one of the two kinds
/// is missing the step is drawn uniformly.
pub fn sample_reward_step<R: Rng>(rewards: &[Vec<f32>], rng: &mut R) -> Option<(usize, usize)> {
    let num_envs = rewards.first()?.len();
    let env = (0..num_envs)
        .map(|env| (env, rewards.iter().map(|row| row[env]).sum::<f32>()))
        .fold(None, |best: Option<(usize, f32)>, (env, total)| match best {
            Some((_, best_total)) if best_total >= total => best,
            _ => Some((env, total)),
        })
        .map(|(env, _)| env)?;
    let (nonzero, zero): (Vec<usize>, Vec<usize>) =
        (0..rewards.len()).partition(|t| rewards[*t][env] != 0.);
    let t = if nonzero.is_empty() || zero.is_empty() {
        rng.random_range(0..rewards.len())
    } else if rng.random_bool(0.5) {
        *nonzero.choose(rng)?
    } else {
        *zero.choose(rng)?
    };
    Some((t, env))
}

#[cfg(test)]
mod test {
    use super::{one_hot_reward, reward_class, sample_reward_step};
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn sign_classes() {
        assert_eq!(reward_class(0.), 0);
        assert_eq!(reward_class(2.5), 1);
        assert_eq!(reward_class(-0.1), 2);
        assert_eq!(one_hot_reward(-3.), [0., 0., 1.]);
    }

    #[test]
    fn best_env_is_sampled_with_balanced_classes() {
        let rewards = vec![
            vec![0., 1.],
            vec![1., 0.],
            vec![0., 0.],
            vec![0., 0.],
            vec![0., 5.],
        ];
        let mut rng = StdRng::seed_from_u64(1);
        let mut nonzero = 0;
        let draws = 2000;
        for _ in 0..draws {
            let (t, env) = sample_reward_step(&rewards, &mut rng).unwrap();
            assert_eq!(env, 1);
            if rewards[t][env] != 0. {
                nonzero += 1;
            }
        }
        // 2 of the 5 steps pay, yet they are drawn half of the time
        let share = nonzero as f32 / draws as f32;
        assert!((share - 0.5).abs() < 0.05, "{share}");
    }

    #[test]
    fn empty_window_has_no_sample() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_reward_step(&[], &mut rng), None);
    }
}
