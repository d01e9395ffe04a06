fn main() {
    use unknown_order::BigNumber;
    let zero = vec![0u8; 64];
    let v = BigNumber::from_slice(&zero);
    println!("v == zero: {}", v == BigNumber::zero());
    println!("v: {:?}", v);
    println!("zero: {:?}", BigNumber::zero());
}
