/// `f = (N-1)/3`, quorum = `2f+1`, with a floor of 2 votes when `N <= 4`
/// (spec §4.5, GLOSSARY): a test-oriented accommodation for small
/// networks, stated explicitly so every implementer reproduces it rather
/// than deriving a different floor independently.
pub fn quorum_for(total_nodes: usize) -> usize {
    if total_nodes <= 4 {
        2
    } else {
        let f = (total_nodes - 1) / 3;
        2 * f + 1
    }
}
