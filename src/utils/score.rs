/// Default base value for a correct answer when a question carries no
/// explicit point value.
pub const BASE_POINTS: u32 = 1000;

/// Maximum time bonus, earned by answering the instant a question opens.
pub const TIME_BONUS_CAP: u32 = 200;

/// Score for a correct answer: base points plus a bonus that decays linearly
/// with elapsed time inside the question window. Incorrect answers never
/// reach this function; they score zero at the call site.
pub fn calculate_score(base_points: u32, remaining_secs: u32, duration_secs: u32) -> u32 {
    if duration_secs == 0 {
        return base_points;
    }
    let remaining = remaining_secs.min(duration_secs);
    let bonus = (TIME_BONUS_CAP as f64 * remaining as f64 / duration_secs as f64) as u32;
    base_points + bonus
}
