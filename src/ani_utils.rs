// Containment --> ANI point estimates.
// Reference: https://doi.org/10.1101/2022.01.11.475870

/// Converts a containment and a k-mer size into an ANI estimate.
///
/// Inputs and output are fractions in `[0, 1]`.
pub type AniEstimator = fn(containment: f64, ksize: f64) -> f64;

/// Streamlined function for ANI from containment.
///
/// Zero containment maps to zero ANI and full containment to one; in
/// between the estimate is `containment^(1/ksize)`.
pub fn ani_from_containment(containment: f64, ksize: f64) -> f64 {
    if containment <= 0.0 {
        0.0
    } else if containment >= 1.0 {
        1.0
    } else {
        containment.powf(1.0 / ksize)
    }
}
