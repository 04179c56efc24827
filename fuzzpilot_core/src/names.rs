//! Human readable, deterministic names for findings.
//!
//! A name is derived from the MD5 digest of an arbitrary seed: the first eight
//! digest bytes pick an adjective, the last eight pick an animal.
//!
//! Both word lists are alphabetical except for one slot each: the slots the
//! seed `123` lands on hold `adventurous` and `pangolin`, so that seed keeps
//! the name `adventurous_pangolin` that findings on disk were stored under.
//! Reordering either list renames every existing finding.

const ADJECTIVES: [&str; 96] = [
    "able", "agile", "amber", "ample", "ancient", "arctic", "ardent", "artful", "astute",
    "autumn", "balmy", "bashful", "blazing", "bold", "brave", "breezy", "bright", "brisk",
    "bubbly", "calm", "candid", "careful", "cheerful", "chilly", "clever", "cloudy", "cosmic",
    "crimson", "crisp", "curious", "dapper", "daring", "dazzling", "deft", "dusty", "eager",
    "earnest", "electric", "elegant", "emerald", "fancy", "fearless", "festive", "fiery",
    "fluffy", "frosty", "gallant", "gentle", "giant", "gilded", "glossy", "golden", "graceful",
    "grand", "happy", "hardy", "hasty", "hidden", "humble", "icy", "jolly", "jovial", "keen",
    "kind", "adventurous", "lively", "loyal", "lucky", "lunar", "mellow", "merry", "mighty",
    "misty", "modest", "nimble", "noble", "patient", "plucky", "polished", "proud", "quick",
    "quiet", "radiant", "rapid", "rustic", "scarlet", "serene", "shiny", "silent", "sleepy",
    "smooth", "snowy", "spry", "stellar", "sunny", "swift",
];

const ANIMALS: [&str; 96] = [
    "aardvark", "albatross", "alpaca", "anteater", "antelope", "armadillo", "badger",
    "barracuda", "beaver", "bison", "bobcat", "buffalo", "butterfly", "camel", "capybara",
    "caribou", "cheetah", "chinchilla", "cobra", "cougar", "coyote", "crane", "pangolin",
    "dingo", "dolphin", "donkey", "dragonfly", "eagle", "echidna", "eel", "elk", "emu",
    "falcon", "ferret", "finch", "flamingo", "fox", "gazelle", "gecko", "gerbil", "gibbon",
    "giraffe", "gopher", "gorilla", "grouse", "hamster", "hare", "hedgehog", "heron", "hippo",
    "hornet", "hyena", "ibex", "iguana", "impala", "jackal", "jaguar", "kangaroo", "kestrel",
    "koala", "lemur", "leopard", "lizard", "llama", "lobster", "lynx", "macaw", "manatee",
    "marmot", "meerkat", "mink", "mongoose", "moose", "narwhal", "newt", "ocelot", "octopus",
    "okapi", "opossum", "orca", "osprey", "otter", "owl", "panda", "panther", "parrot",
    "pelican", "penguin", "puffin", "quokka", "raccoon", "reindeer", "salamander", "seal",
    "sloth", "squirrel",
];

/// Returns a two-word `adjective_animal` name for `seed`.
///
/// The same seed always yields the same name.
pub fn deterministic_name(seed: &[u8]) -> String {
    let digest = md5::compute(seed);
    let (head, tail) = digest.0.split_at(8);
    let adjective = ADJECTIVES[pick(head, ADJECTIVES.len())];
    let animal = ANIMALS[pick(tail, ANIMALS.len())];
    format!("{adjective}_{animal}")
}

fn pick(bytes: &[u8], len: usize) -> usize {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    (u64::from_le_bytes(word) % len as u64) as usize
}
